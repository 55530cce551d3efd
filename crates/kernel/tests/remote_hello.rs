//! OCAP URL redemption and a remote method call across two kernels in one
//! process, each with its own database and listener.

mod common;

use common::new_kernel;
use kestrel_comms::CommsOptions;
use kestrel_common::CapData;
use kestrel_kernel::Kernel;
use kestrel_storage::InMemoryBackend;
use serde_json::json;
use std::time::Duration;

/// Keep a kernel's loop turning while another future drives the test.
/// Never returns normally.
async fn pump(kernel: &mut Kernel) {
    loop {
        let _ = kernel.step().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn url_redemption_and_hello_across_kernels() {
    let backend1 = InMemoryBackend::new();
    let backend2 = InMemoryBackend::new();
    let mut kernel1 = new_kernel(&backend1);
    let mut kernel2 = new_kernel(&backend2);

    kernel1
        .init_remote_comms(CommsOptions {
            key_seed: Some(b"kernel-one".to_vec()),
            ..CommsOptions::default()
        })
        .await
        .expect("init comms 1");
    kernel2
        .init_remote_comms(CommsOptions {
            key_seed: Some(b"kernel-two".to_vec()),
            ..CommsOptions::default()
        })
        .await
        .expect("init comms 2");
    assert!(matches!(
        kernel1
            .init_remote_comms(CommsOptions::default())
            .await
            .expect_err("second init"),
        kestrel_kernel::KernelError::CommsAlreadyInitialized
    ));

    // teach each kernel where the other listens
    let (peer1, addr1) = {
        let comms = kernel1.remote_comms().expect("comms");
        (comms.peer_id().clone(), comms.local_addr())
    };
    let (peer2, addr2) = {
        let comms = kernel2.remote_comms().expect("comms");
        (comms.peer_id().clone(), comms.local_addr())
    };
    kernel1
        .remote_comms()
        .expect("comms")
        .add_peer_address(peer2, addr2)
        .await;
    kernel2
        .remote_comms()
        .expect("comms")
        .add_peer_address(peer1, addr1)
        .await;

    // kernel 2 hosts the greeter and issues a URL for its root
    let launch = kernel2
        .launch_subcluster(
            serde_json::from_value(json!({
                "bootstrap": "receiver",
                "vats": [{
                    "name": "receiver",
                    "bundle": "greeter",
                    "parameters": { "name": "Receiver" }
                }]
            }))
            .expect("valid config"),
        )
        .await
        .expect("launch");
    let vats = kernel2
        .get_subcluster_vats(launch.subcluster_id)
        .expect("vats");
    let receiver_root = kernel2
        .store()
        .vat_record(vats[0])
        .expect("vat record")
        .root;
    let url = kernel2.issue_ocap_url(receiver_root).expect("issue url");
    assert!(url.starts_with("ocap:"));

    // kernel 1 redeems the URL, minting a remote proxy kref
    let remote_kref = tokio::select! {
        redeemed = kernel1.redeem_ocap_url(&url) => redeemed.expect("redeem"),
        _ = pump(&mut kernel2) => unreachable!(),
    };
    assert_eq!(
        kernel1
            .store()
            .object_owner(remote_kref)
            .expect("owner")
            .map(|owner| owner.to_string()),
        Some(format!(
            "remote:{}",
            kernel2.remote_comms().expect("comms").peer_id()
        ))
    );

    // and calls through it
    let args = CapData::from_value(&json!(["RemoteSender from Kernel1"])).expect("marshal");
    let reply = tokio::select! {
        reply = kernel1.queue_message(remote_kref, "hello", args) => reply.expect("hello"),
        _ = pump(&mut kernel2) => unreachable!(),
    };
    assert_eq!(
        reply.as_string().as_deref(),
        Some("Receiver says hello back to RemoteSender from Kernel1")
    );
}

#[tokio::test]
async fn malformed_and_unknown_urls_are_rejected() {
    let backend = InMemoryBackend::new();
    let mut kernel = new_kernel(&backend);
    kernel
        .init_remote_comms(CommsOptions::default())
        .await
        .expect("init comms");

    assert!(kernel.redeem_ocap_url("not-a-url").await.is_err());

    // well-formed but never issued: local lookup fails
    let peer = kernel
        .remote_comms()
        .expect("comms")
        .peer_id()
        .clone();
    let bogus = format!("ocap:{peer}/00112233445566778899aabbccddeeff");
    assert!(kernel.redeem_ocap_url(&bogus).await.is_err());
}
