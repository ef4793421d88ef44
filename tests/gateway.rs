use color_eyre::Result;
use common::{
    connect, expect_no_message, receive_message, register_mock, send_command, start_server,
};
use futures::SinkExt;
use senso_bridge::protocol::{Command, DeviceInfo, Message};

mod common;

#[tokio::test]
async fn driver_info_is_served_at_the_root() -> Result<()> {
    let port = start_server().await;

    let info: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{port}/"))
        .await?
        .json()
        .await?;

    assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
    assert!(info["message"].is_string());
    assert!(info["os"].is_string());
    assert!(info["arch"].is_string());
    Ok(())
}

#[tokio::test]
async fn rfid_readers_listing_is_served() -> Result<()> {
    let port = start_server().await;

    let body: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{port}/rfid/readers"))
        .await?
        .json()
        .await?;

    assert!(body["readers"].is_array());
    Ok(())
}

#[tokio::test]
async fn flex_status_starts_disconnected() -> Result<()> {
    let port = start_server().await;
    let mut client = connect(port, "/flex", Some("manual-connect")).await?;

    send_command(&mut client, &Command::GetStatus).await?;

    assert_eq!(receive_message(&mut client).await?, Message::disconnected());
    Ok(())
}

#[tokio::test]
async fn senso_status_starts_disconnected() -> Result<()> {
    let port = start_server().await;
    let mut client = connect(port, "/senso", None).await?;

    send_command(&mut client, &Command::GetStatus).await?;

    assert_eq!(receive_message(&mut client).await?, Message::disconnected());
    Ok(())
}

#[tokio::test]
async fn unknown_command_is_warned_but_does_not_close() -> Result<()> {
    let port = start_server().await;
    let mut client = connect(port, "/flex", Some("manual-connect")).await?;

    client
        .send(tokio_tungstenite::tungstenite::Message::Text(
            r#"{"type":"Reboot"}"#.into(),
        ))
        .await?;

    // The connection survives and keeps answering.
    send_command(&mut client, &Command::GetStatus).await?;
    assert_eq!(receive_message(&mut client).await?, Message::disconnected());
    Ok(())
}

#[tokio::test]
async fn connect_to_unopenable_device_leaves_status_untouched() -> Result<()> {
    let port = start_server().await;

    // The device is registered, but its path is no real serial port, so
    // connecting fails and the session state must not change.
    register_mock(
        port,
        "/tmp/vtty_missing",
        "16C0",
        "Teensyduino",
        "USB Serial",
        "42",
    )
    .await;

    let mut client = connect(port, "/flex", Some("manual-connect")).await?;

    send_command(
        &mut client,
        &Command::Connect {
            address: "/tmp/vtty_missing".into(),
        },
    )
    .await?;

    send_command(&mut client, &Command::GetStatus).await?;
    assert_eq!(receive_message(&mut client).await?, Message::disconnected());
    Ok(())
}

#[tokio::test]
async fn discover_reports_each_classifying_device_once() -> Result<()> {
    let port = start_server().await;

    // Three registered devices, two of which classify: the third has the
    // wrong vendor id.
    register_mock(port, "/tmp/vtty_0", "16C0", "Mock", "PASSTHRU-Replay", "1").await;
    register_mock(
        port,
        "/tmp/vtty_1",
        "16C0",
        "Teensyduino",
        "USB Serial",
        "2",
    )
    .await;
    register_mock(port, "/tmp/vtty_2", "14F2", "Acme", "Gadget", "3").await;

    let mut client = connect(port, "/flex", Some("manual-connect")).await?;

    send_command(&mut client, &Command::Discover { duration: 5 }).await?;

    let mut discovered_paths = Vec::new();
    for _ in 0..2 {
        let Message::Discovered {
            device: DeviceInfo::Flex { usb_device },
            ..
        } = receive_message(&mut client).await?
        else {
            panic!("Expected a flex discovery")
        };
        discovered_paths.push(usb_device.path);
    }

    discovered_paths.sort();
    assert_eq!(discovered_paths, vec!["/tmp/vtty_0", "/tmp/vtty_1"]);

    // Exactly two: the rejected device never shows up.
    expect_no_message(&mut client).await;
    Ok(())
}

#[tokio::test]
async fn discovered_passthru_devices_conceal_their_marker() -> Result<()> {
    let port = start_server().await;

    register_mock(
        port,
        "/tmp/vtty_0",
        "16C0",
        "Mock",
        "PASSTHRU-Dividat16x16",
        "9",
    )
    .await;

    let mut client = connect(port, "/flex", Some("manual-connect")).await?;
    send_command(&mut client, &Command::Discover { duration: 5 }).await?;

    let Message::Discovered {
        device: DeviceInfo::Flex { usb_device },
        ..
    } = receive_message(&mut client).await?
    else {
        panic!("Expected a flex discovery")
    };

    assert_eq!(usb_device.product, "Dividat16x16");
    assert_eq!(usb_device.serial_number, "9");
    Ok(())
}

#[tokio::test]
async fn discover_with_zero_duration_stays_silent() -> Result<()> {
    let port = start_server().await;

    register_mock(port, "/tmp/vtty_0", "16C0", "Teensyduino", "USB Serial", "1").await;

    let mut client = connect(port, "/flex", Some("manual-connect")).await?;
    send_command(&mut client, &Command::Discover { duration: 0 }).await?;

    expect_no_message(&mut client).await;
    Ok(())
}

#[tokio::test]
async fn mock_devices_can_be_registered_and_removed() -> Result<()> {
    let port = start_server().await;

    let first = register_mock(port, "/tmp/vtty_0", "16C0", "Teensyduino", "A", "1").await;
    let second = register_mock(port, "/tmp/vtty_1", "16C0", "Teensyduino", "B", "2").await;
    assert_ne!(first, second);

    let client = reqwest::Client::new();

    let response = client
        .delete(format!("http://127.0.0.1:{port}/flex/mock/{first}"))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    // Removing it again reports that it is gone.
    let response = client
        .delete(format!("http://127.0.0.1:{port}/flex/mock/{first}"))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}
