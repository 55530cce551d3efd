//! A run-queue record hand-written into the database is consumed on the
//! next run after reopening, exactly once.

mod common;

use common::{counter_config, empty_args, new_kernel, sole_vat_root};
use kestrel_common::KRef;
use kestrel_storage::{BatchOp, InMemoryBackend, StorageBackend};
use serde_json::json;

fn queue_key(suffix: &str) -> String {
    format!("kv.v1.queue.run.{suffix}")
}

#[tokio::test]
async fn handwritten_send_replays_once_after_reopen() {
    let backend = InMemoryBackend::new();

    let root: KRef = {
        let mut kernel = new_kernel(&backend);
        let launch = kernel
            .launch_subcluster(counter_config())
            .await
            .expect("launch");
        let vats = kernel
            .get_subcluster_vats(launch.subcluster_id)
            .expect("vats");
        sole_vat_root(&kernel, vats[0])
    };

    // stopped kernel: splice a send record directly into the database
    let tail: u64 = backend
        .get(&queue_key("tail"))
        .expect("get tail")
        .and_then(|text| text.parse().ok())
        .unwrap_or(1);
    let record = json!({
        "type": "send",
        "target": root.to_string(),
        "message": {
            "method": "resume",
            "args": { "body": "#[]", "slots": [] }
        }
    });
    backend
        .write_batch(vec![
            BatchOp::Put {
                key: queue_key(&tail.to_string()),
                value: record.to_string(),
            },
            BatchOp::Put {
                key: queue_key("tail"),
                value: (tail + 1).to_string(),
            },
        ])
        .expect("splice record");

    let mut kernel = new_kernel(&backend);
    kernel.resume().expect("resume");
    kernel.run_until_quiescent().await.expect("drain");

    // the spliced record is gone from the database
    assert_eq!(
        backend.get(&queue_key(&tail.to_string())).expect("get"),
        None
    );

    // and it advanced the counter exactly once: bootstrap set 1, the
    // spliced resume made 2, so the next call lands on 3
    let reply = kernel
        .queue_message(root, "resume", empty_args())
        .await
        .expect("resume");
    assert_eq!(
        reply.as_string().as_deref(),
        Some("Counter incremented to: 3")
    );
}
