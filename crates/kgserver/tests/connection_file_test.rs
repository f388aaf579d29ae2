//
// connection_file_test.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::collections::HashSet;

use kgserver::connection_file::{ConnectionFile, ReservedPorts};

#[test]
fn test_generate_picks_distinct_reserved_ports() {
    let reserved = ReservedPorts::new();
    let first = ConnectionFile::generate(String::from("127.0.0.1"), &reserved).unwrap();
    let second = ConnectionFile::generate(String::from("127.0.0.1"), &reserved).unwrap();

    let ports: HashSet<u16> = first.ports().into_iter().chain(second.ports()).collect();
    assert_eq!(ports.len(), 10);
    assert_eq!(reserved.len(), 10);

    assert_eq!(first.transport, "tcp");
    assert_eq!(first.signature_scheme, "hmac-sha256");
    assert_eq!(first.key.len(), 32);
    assert_ne!(first.key, second.key);

    reserved.release(&first);
    assert_eq!(reserved.len(), 5);
    reserved.release(&second);
    assert!(reserved.is_empty());
}

#[test]
fn test_write_and_read_back() {
    let reserved = ReservedPorts::new();
    let connection = ConnectionFile::generate(String::from("127.0.0.1"), &reserved).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernel.json");

    connection.to_file(&path).unwrap();
    let read = ConnectionFile::from_file(&path).unwrap();

    assert_eq!(read, connection);
    assert_eq!(
        read.endpoint(read.shell_port),
        format!("tcp://127.0.0.1:{}", read.shell_port)
    );
}

#[test]
fn test_reading_a_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.json");
    assert!(ConnectionFile::from_file(path).is_err());
}
