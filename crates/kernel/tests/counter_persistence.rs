//! The counter subcluster keeps counting after the kernel is stopped and
//! reopened over the same database.

mod common;

use common::{counter_config, empty_args, new_kernel, sole_vat_root};
use kestrel_storage::InMemoryBackend;

#[tokio::test]
async fn counter_survives_database_reopen() {
    let backend = InMemoryBackend::new();

    let root = {
        let mut kernel = new_kernel(&backend);
        let launch = kernel
            .launch_subcluster(counter_config())
            .await
            .expect("launch");
        assert_eq!(
            launch.bootstrap_result.as_string().as_deref(),
            Some("Counter initialized with count: 1")
        );

        let vats = kernel
            .get_subcluster_vats(launch.subcluster_id)
            .expect("vats");
        let root = sole_vat_root(&kernel, vats[0]);
        let reply = kernel
            .queue_message(root, "resume", empty_args())
            .await
            .expect("resume");
        assert_eq!(
            reply.as_string().as_deref(),
            Some("Counter incremented to: 2")
        );
        root
    };
    // kernel dropped: the backend handle is all that survives

    let mut kernel = new_kernel(&backend);
    kernel.resume().expect("resume from store");
    let reply = kernel
        .queue_message(root, "resume", empty_args())
        .await
        .expect("resume after reopen");
    assert_eq!(
        reply.as_string().as_deref(),
        Some("Counter incremented to: 3")
    );
}

#[tokio::test]
async fn force_reset_discards_prior_state() {
    let backend = InMemoryBackend::new();
    let mut kernel = new_kernel(&backend);
    let first = kernel
        .launch_subcluster(counter_config())
        .await
        .expect("launch");
    let vats = kernel
        .get_subcluster_vats(first.subcluster_id)
        .expect("vats");
    let root = sole_vat_root(&kernel, vats[0]);
    kernel
        .queue_message(root, "resume", empty_args())
        .await
        .expect("resume");

    let mut config = counter_config();
    config.force_reset = true;
    let second = kernel.launch_subcluster(config).await.expect("relaunch");
    assert_ne!(first.subcluster_id, second.subcluster_id);
    assert_eq!(
        second.bootstrap_result.as_string().as_deref(),
        Some("Counter initialized with count: 1")
    );
    // the old subcluster record is gone
    assert!(
        kernel.get_subcluster_vats(first.subcluster_id).is_err(),
        "prior subcluster should be discarded"
    );
}
