//! ---
//! mqb_section: "06-cli"
//! mqb_subsection: "integration-tests"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "End-to-end tests for the mqbridgectl binary."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::fs;

use assert_cmd::Command;
use mqbridge_durable::{FileSubscriptionStore, SubscriptionInfo, SubscriptionStore};
use mqbridge_transport::{ClientId, Destination, MessageId, SubscriptionKey};
use tempfile::tempdir;

fn seed(dir: &std::path::Path) -> SubscriptionKey {
    let store = FileSubscriptionStore::open(dir).unwrap();
    let key = SubscriptionKey::new(ClientId::new("billing"), "invoices");
    store
        .create(
            &key,
            SubscriptionInfo::new(Destination::topic("invoices"), None, false),
        )
        .unwrap();
    store.acknowledge(&key, &MessageId::from("m-1")).unwrap();
    store.acknowledge(&key, &MessageId::from("m-2")).unwrap();
    key
}

#[test]
fn subscriptions_list_prints_each_record() {
    let dir = tempdir().unwrap();
    seed(dir.path());

    let output = Command::cargo_bin("mqbridgectl")
        .unwrap()
        .args(["subscriptions", "list", "--store"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("billing/invoices\ttopic://invoices\tacknowledged=2"));
}

#[test]
fn subscriptions_list_json_is_machine_readable() {
    let dir = tempdir().unwrap();
    seed(dir.path());

    let output = Command::cargo_bin("mqbridgectl")
        .unwrap()
        .args(["subscriptions", "list", "--json", "--store"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows[0]["name"], "invoices");
    assert_eq!(rows[0]["acknowledged"], 2);
}

#[test]
fn show_and_unsubscribe_round_trip() {
    let dir = tempdir().unwrap();
    seed(dir.path());

    let shown = Command::cargo_bin("mqbridgectl")
        .unwrap()
        .args(["subscriptions", "show", "--client-id", "billing", "--name", "invoices", "--store"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(shown.status.success());
    let stdout = String::from_utf8(shown.stdout).unwrap();
    assert!(stdout.contains("Topic: topic://invoices"));
    assert!(stdout.contains("  m-1"));
    assert!(stdout.contains("  m-2"));

    Command::cargo_bin("mqbridgectl")
        .unwrap()
        .args(["unsubscribe", "--client-id", "billing", "--name", "invoices", "--store"])
        .arg(dir.path())
        .assert()
        .success();

    let store = FileSubscriptionStore::open(dir.path()).unwrap();
    assert!(store.subscriptions().unwrap().is_empty());

    Command::cargo_bin("mqbridgectl")
        .unwrap()
        .args(["unsubscribe", "--client-id", "billing", "--name", "invoices", "--store"])
        .arg(dir.path())
        .assert()
        .failure();
}

#[test]
fn demo_round_trips_with_a_file_store() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("bridge.toml");
    let store_dir = dir.path().join("subscriptions");
    let log_dir = dir.path().join("logs");
    fs::write(
        &config_path,
        format!(
            r#"client_id = "demo-client"

[store]
kind = "file"
directory = "{}"

[session]
receive_timeout_ms = 2000

[logging]
directory = "{}"
format = "pretty"
"#,
            store_dir.display().to_string().replace('\\', "/"),
            log_dir.display().to_string().replace('\\', "/")
        ),
    )
    .unwrap();

    let output = Command::cargo_bin("mqbridgectl")
        .unwrap()
        .args(["demo", "--messages", "4", "--ack-mode", "client", "--config"])
        .arg(&config_path)
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Acknowledge mode: client"));
    assert!(stdout.contains("Received: 4"));
    assert!(stdout.contains("Acknowledged: 4"));

    // The demo subscription is removed once the round trip finishes.
    let store = FileSubscriptionStore::open(&store_dir).unwrap();
    assert!(store.subscriptions().unwrap().is_empty());
}

#[test]
fn demo_rejects_unknown_ack_mode() {
    Command::cargo_bin("mqbridgectl")
        .unwrap()
        .args(["demo", "--ack-mode", "sometimes"])
        .assert()
        .failure();
}
