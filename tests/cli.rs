// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end tests driving a real `rcoredumpd` binary over HTTP: spawn it
//! with `Command::cargo_bin`, arm a death-signal so a leftover process never
//! outlives the test, and drive it with `reqwest::blocking`.

use assert_cmd::prelude::*;
use serde_json::json;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;

fn gzip_segment(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

fn upload_body(header: &serde_json::Value, core: &[u8], executable: Option<&[u8]>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend(gzip_segment(&serde_json::to_vec(header).unwrap()));
    body.extend(gzip_segment(core));
    if let Some(exe) = executable {
        body.extend(gzip_segment(exe));
    }
    body
}

/// Marks a command to die when its parent (us) dies, so a test panic never
/// leaks a listening `rcoredumpd`.
fn suicide(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| prctl::set_death_signal(9).map_err(std::io::Error::from_raw_os_error));
    }
}

fn wait_for_port(port: u16) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if reqwest::blocking::get(format!("http://127.0.0.1:{port}/about")).is_ok() {
            return;
        }
        if std::time::Instant::now() > deadline {
            panic!("rcoredumpd never came up on port {port}");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

struct Server {
    port: u16,
    child: std::process::Child,
    _data_dir: tempfile::TempDir,
}

impl Server {
    fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_server() -> Server {
    let data_dir = tempfile::tempdir().unwrap();
    let port: u16 = 20000 + (rand::random::<u16>() % 10000);
    let mut cmd = Command::cargo_bin("rcoredumpd").unwrap();
    cmd.arg("--bind").arg(format!("127.0.0.1:{port}"));
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd.arg("--retention-duration").arg("0");
    cmd.env("RUST_LOG", "rcoredump=debug,tower_http=warn,warn");
    suicide(&mut cmd);
    let child = cmd.spawn().unwrap();
    wait_for_port(port);
    Server {
        port,
        child,
        _data_dir: data_dir,
    }
}

fn poll_until<T>(mut f: impl FnMut() -> Option<T>, timeout: Duration) -> T {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if let Some(v) = f() {
            return v;
        }
        if std::time::Instant::now() > deadline {
            panic!("condition never became true within {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Scenario 1 from the design notes: a fresh upload is immediately
/// retrievable by uid, the executable is present, and metadata search finds
/// it.
#[test]
fn fresh_ingest_is_retrievable_and_searchable() {
    let server = spawn_server();
    let client = reqwest::blocking::Client::new();

    let header = json!({
        "dumped_at": "2020-05-01T10:00:00Z",
        "hostname": "h1",
        "executable_path": "/bin/x",
        "executable_hash": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        "include_executable": true,
        "metadata": {"service": "s"},
        "forwarder_version": "test",
        "links": [],
    });
    let body = upload_body(&header, b"CORE1", Some(b"ELF1"));

    let resp = client
        .post(format!("{}/cores", server.url()))
        .body(body)
        .send()
        .unwrap();
    assert!(resp.status().is_success());

    let resp = client
        .head(format!(
            "{}/executables/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            server.url()
        ))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 200);

    let search: serde_json::Value = client
        .get(format!("{}/cores?q=meta.service:s", server.url()))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(search["total"], 1);
    let uid = search["results"][0]["uid"].as_str().unwrap().to_string();

    let core_bytes = client
        .get(format!("{}/cores/{uid}", server.url()))
        .send()
        .unwrap()
        .bytes()
        .unwrap();
    assert_eq!(&core_bytes[..], b"CORE1");
}

/// Scenario 2: two uploads sharing an `executable_hash`, the second marking
/// `include_executable: false`, still end with the executable present and
/// identical to what the first upload sent.
#[test]
fn executable_is_deduplicated_across_uploads() {
    let server = spawn_server();
    let client = reqwest::blocking::Client::new();
    let hash = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    let first_header = json!({
        "dumped_at": "2020-05-01T10:00:00Z",
        "hostname": "h1",
        "executable_path": "/bin/x",
        "executable_hash": hash,
        "include_executable": true,
        "metadata": {},
        "forwarder_version": "test",
        "links": [],
    });
    let resp = client
        .post(format!("{}/cores", server.url()))
        .body(upload_body(&first_header, b"CORE1", Some(b"ELF-DEDUP")))
        .send()
        .unwrap();
    assert!(resp.status().is_success());

    let second_header = json!({
        "dumped_at": "2020-05-01T10:05:00Z",
        "hostname": "h2",
        "executable_path": "/bin/x",
        "executable_hash": hash,
        "include_executable": false,
        "metadata": {},
        "forwarder_version": "test",
        "links": [],
    });
    let resp = client
        .post(format!("{}/cores", server.url()))
        .body(upload_body(&second_header, b"CORE2", None))
        .send()
        .unwrap();
    assert!(resp.status().is_success());

    let resp = client
        .head(format!("{}/executables/{hash}", server.url()))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 200);

    let search: serde_json::Value = client
        .get(format!("{}/cores?q=hostname:h1", server.url()))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(search["total"], 1);
    let search: serde_json::Value = client
        .get(format!("{}/cores?q=hostname:h2", server.url()))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(search["total"], 1);
}

/// Scenario 4: deleting the only core referencing an executable eventually
/// reclaims both the core and the executable blob.
#[test]
fn deleting_the_last_referencer_reclaims_the_executable() {
    let server = spawn_server();
    let client = reqwest::blocking::Client::new();
    let hash = "cccccccccccccccccccccccccccccccccccccccc";

    let header = json!({
        "dumped_at": "2020-05-01T10:00:00Z",
        "hostname": "h1",
        "executable_path": "/bin/x",
        "executable_hash": hash,
        "include_executable": true,
        "metadata": {},
        "forwarder_version": "test",
        "links": [],
    });
    client
        .post(format!("{}/cores", server.url()))
        .body(upload_body(&header, b"CORE1", Some(b"ELF1")))
        .send()
        .unwrap()
        .error_for_status()
        .unwrap();

    let search: serde_json::Value = client
        .get(format!("{}/cores?q=hostname:h1", server.url()))
        .send()
        .unwrap()
        .json()
        .unwrap();
    let uid = search["results"][0]["uid"].as_str().unwrap().to_string();

    let resp = client
        .delete(format!("{}/cores/{uid}", server.url()))
        .send()
        .unwrap();
    assert!(resp.status().is_success());

    poll_until(
        || {
            let status = client
                .get(format!("{}/cores/{uid}", server.url()))
                .send()
                .ok()?
                .status();
            (status == 404).then_some(())
        },
        Duration::from_secs(5),
    );

    poll_until(
        || {
            let status = client
                .head(format!("{}/executables/{hash}", server.url()))
                .send()
                .ok()?
                .status();
            (status == 404).then_some(())
        },
        Duration::from_secs(5),
    );
}
