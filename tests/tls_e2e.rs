//! TLS end-to-end: a server with a self-signed certificate, a client that
//! accepts it and surfaces the fingerprint, transfers riding the same TLS
//! config.

use easyshare::client::Connection;
use easyshare::protocol::{FileEntry, OverwritePolicy};
use easyshare::server::{Server, ServerOptions};
use easyshare::sharing::Sharing;
use easyshare::tls;
use std::fs;
use tempfile::TempDir;

fn start_tls_server(tmp: &TempDir) -> (u16, String) {
    let sharing = Sharing::register(Some("secure"), tmp.path(), false).unwrap();
    let mut opts = ServerOptions::new("tls-test", vec![sharing]);
    opts.address = "127.0.0.1".parse().unwrap();
    opts.port = 0;
    opts.discover_port = 0;
    let server_tls = tls::server_tls(None, None, "127.0.0.1").unwrap();
    let fingerprint = server_tls.fingerprint.clone();
    opts.tls = Some(server_tls);

    let server = Server::bind(opts).unwrap();
    let port = server.local_port();
    std::thread::spawn(move || {
        let _ = server.run();
    });
    (port, fingerprint)
}

fn no_prompt() -> impl FnMut(&FileEntry) -> bool {
    |_: &FileEntry| panic!("prompt must not fire")
}

#[test]
fn tls_control_channel_and_fingerprint() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("hello.txt"), b"over tls").unwrap();
    let (port, fingerprint) = start_tls_server(&tmp);

    let mut conn = Connection::connect("127.0.0.1", port, true).unwrap();
    conn.show_progress = false;

    let descriptor = conn.info().unwrap();
    assert!(descriptor.ssl);
    assert_eq!(descriptor.fingerprint.as_deref(), Some(fingerprint.as_str()));

    // The verifier recorded the certificate the server actually presented
    assert_eq!(conn.fingerprint().as_deref(), Some(fingerprint.as_str()));
}

#[test]
fn tls_transfer_roundtrip() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir(tmp.path().join("data")).unwrap();
    fs::write(tmp.path().join("data/a.bin"), vec![42u8; 100_000]).unwrap();
    let (port, _) = start_tls_server(&tmp);

    let mut conn = Connection::connect("127.0.0.1", port, true).unwrap();
    conn.show_progress = false;
    conn.open("secure").unwrap();

    let dest = TempDir::new().unwrap();
    let stats = conn
        .get(vec!["data".into()], OverwritePolicy::Yes, dest.path(), &mut no_prompt())
        .unwrap();
    assert_eq!(stats.files_ok, 1);
    assert_eq!(stats.bytes_ok, 100_000);
    assert_eq!(fs::read(dest.path().join("data/a.bin")).unwrap(), vec![42u8; 100_000]);

    // Upload over TLS too
    let local = TempDir::new().unwrap();
    fs::write(local.path().join("up.bin"), b"tls upload").unwrap();
    let stats = conn
        .put(&[local.path().join("up.bin")], OverwritePolicy::Yes, &mut no_prompt())
        .unwrap();
    assert_eq!(stats.remote.unwrap().files_ok, 1);
    assert_eq!(fs::read(tmp.path().join("up.bin")).unwrap(), b"tls upload");
}
