mod common;

use std::{net::TcpListener, sync::Arc, thread, time::Duration};

use common::*;
use edge_gateway::{Gateway, GatewayError, GatewayState};

#[test]
fn stop_releases_camera_and_socket_for_the_next_start() {
    let addr = free_addr();
    let gateway = Gateway::new(test_config(addr));
    let camera = Arc::new(ScriptedCamera::new(true));

    for _ in 0..3 {
        let bound = gateway.start(camera.clone(), None).unwrap();
        assert_eq!(bound, addr);
        assert_eq!(gateway.state(), GatewayState::Running);
        assert!(wait_until(Duration::from_secs(5), || camera.opens() > camera.releases()));

        gateway.stop();
        assert_eq!(gateway.state(), GatewayState::Stopped);
        assert_eq!(camera.opens(), camera.releases());
    }

    assert!(wait_until(Duration::from_secs(2), || TcpListener::bind(addr).is_ok()));
}

#[test]
fn repeated_start_and_stop_are_no_ops() {
    let gateway = Gateway::new(test_config("127.0.0.1:0".parse().unwrap()));
    let camera = Arc::new(ScriptedCamera::new(true));

    let first = gateway.start(camera.clone(), None).unwrap();
    let second = gateway.start(camera.clone(), None).unwrap();
    assert_eq!(first, second);
    assert_eq!(gateway.local_addr(), Some(first));

    thread::sleep(Duration::from_millis(100));
    assert_eq!(camera.opens(), 1);

    gateway.stop();
    gateway.stop();
    assert_eq!(gateway.state(), GatewayState::Stopped);
    assert_eq!(gateway.local_addr(), None);
    assert_eq!(camera.releases(), 1);
}

#[test]
fn bind_failure_leaves_the_gateway_stopped() {
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let gateway = Gateway::new(test_config(occupied.local_addr().unwrap()));
    let camera = Arc::new(ScriptedCamera::new(true));

    let err = gateway.start(camera.clone(), None).unwrap_err();
    assert!(matches!(err, GatewayError::Bind { .. }), "{err}");
    assert_eq!(gateway.state(), GatewayState::Stopped);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(camera.opens(), 0);
}

#[test]
fn missing_camera_does_not_prevent_serving() {
    let gateway = Gateway::new(test_config("127.0.0.1:0".parse().unwrap()));
    let addr = gateway.start(Arc::new(MissingCamera), None).unwrap();
    let agent = http_agent();

    let (status, body) = get_json(&agent, &format!("http://{addr}/status"));
    assert_eq!(status, 200);
    assert_eq!(body["camera_ready"], false);
    assert_eq!(body["annotation"], "unavailable");

    let (status, _) = get_json(&agent, &format!("http://{addr}/sensors"));
    assert_eq!(status, 200);

    gateway.stop();
}

#[test]
fn stop_can_be_called_from_another_thread() {
    let gateway = Arc::new(Gateway::new(test_config("127.0.0.1:0".parse().unwrap())));
    gateway
        .start(Arc::new(ScriptedCamera::new(true)), None)
        .unwrap();

    let remote = gateway.clone();
    thread::spawn(move || remote.stop()).join().unwrap();
    assert_eq!(gateway.state(), GatewayState::Stopped);
}

#[cfg(unix)]
#[test]
fn stalled_ffmpeg_camera_does_not_block_stop() {
    use std::os::unix::fs::PermissionsExt;

    use video_ingest::FfmpegCameraSource;

    let dir = std::env::temp_dir().join(format!("stalled-ffmpeg-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let binary = dir.join("ffmpeg");
    std::fs::write(&binary, "#!/bin/sh\nexec sleep 1000\n").unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

    let camera = FfmpegCameraSource::new("0", (64, 48))
        .with_binary(binary.display().to_string())
        .with_timeouts(Duration::from_millis(300), Duration::from_millis(100));
    let gateway = Arc::new(Gateway::new(test_config("127.0.0.1:0".parse().unwrap())));
    gateway.start(Arc::new(camera), None).unwrap();
    thread::sleep(Duration::from_millis(150));

    let remote = gateway.clone();
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        remote.stop();
        let _ = done_tx.send(());
    });
    assert!(
        done_rx.recv_timeout(Duration::from_secs(3)).is_ok(),
        "stop did not return with a camera that never delivers a frame"
    );
    assert_eq!(gateway.state(), GatewayState::Stopped);
}
