//! End-to-end command behavior through the sync client.

mod common;

use std::time::Duration;

use fkv_client::ClientTtl;
use fkv_common::resp::Value;

use common::TestServer;

#[test]
fn ping_with_and_without_payload() {
    let server = TestServer::start();
    let client = server.client();

    assert_eq!(client.ping(None).unwrap(), b"PONG".to_vec());
    assert_eq!(client.ping(Some(b"hello")).unwrap(), b"hello".to_vec());
}

#[test]
fn set_get_delete_cycle() {
    let server = TestServer::start();
    let client = server.client();

    client.set(b"foo", b"bar").unwrap();
    assert_eq!(client.get(b"foo").unwrap(), Some(b"bar".to_vec()));
    assert_eq!(client.get(b"missing").unwrap(), None);
    assert!(client.delete(b"foo").unwrap());
    assert_eq!(client.get(b"foo").unwrap(), None);
    assert!(!client.delete(b"foo").unwrap());
}

#[test]
fn del_counts_only_present_keys() {
    let server = TestServer::start();
    let client = server.client();

    client.set(b"a", b"1").unwrap();
    client.set(b"c", b"3").unwrap();
    let reply = client.command(&[b"DEL", b"a", b"b", b"c"]).unwrap();
    assert_eq!(reply, Value::Integer(2));

    let reply = client.command(&[b"EXISTS", b"a", b"b", b"c"]).unwrap();
    assert_eq!(reply, Value::Integer(0));
}

#[test]
fn exists_counts_duplicates_multiply() {
    let server = TestServer::start();
    let client = server.client();

    client.set(b"a", b"1").unwrap();
    let reply = client.command(&[b"EXISTS", b"a", b"a", b"b"]).unwrap();
    assert_eq!(reply, Value::Integer(2));
}

#[test]
fn expire_ttl_lifecycle() {
    let server = TestServer::start();
    let client = server.client();

    client.set(b"k", b"v").unwrap();
    assert_eq!(client.ttl(b"k").unwrap(), ClientTtl::NoExpiry);
    assert!(client.expire(b"k", Duration::from_secs(1)).unwrap());
    match client.ttl(b"k").unwrap() {
        ClientTtl::ExpiresIn(remaining) => assert!(remaining <= Duration::from_secs(1)),
        other => panic!("unexpected ttl: {:?}", other),
    }

    std::thread::sleep(Duration::from_millis(1200));
    assert_eq!(client.get(b"k").unwrap(), None);
    assert_eq!(client.ttl(b"k").unwrap(), ClientTtl::Missing);
}

#[test]
fn expire_on_missing_key_returns_zero() {
    let server = TestServer::start();
    let client = server.client();

    assert!(!client.expire(b"missing", Duration::from_secs(10)).unwrap());
    assert_eq!(client.ttl(b"missing").unwrap(), ClientTtl::Missing);
}

#[test]
fn set_clears_ttl_and_persist_removes_it() {
    let server = TestServer::start();
    let client = server.client();

    client.set(b"k", b"v").unwrap();
    assert!(client.expire(b"k", Duration::from_secs(100)).unwrap());
    client.set(b"k", b"v2").unwrap();
    assert_eq!(client.ttl(b"k").unwrap(), ClientTtl::NoExpiry);

    assert!(client.expire(b"k", Duration::from_secs(100)).unwrap());
    assert!(client.persist(b"k").unwrap());
    assert!(!client.persist(b"k").unwrap());
    assert_eq!(client.ttl(b"k").unwrap(), ClientTtl::NoExpiry);
}

#[test]
fn set_with_ex_option_expires() {
    let server = TestServer::start();
    let client = server.client();

    client
        .set_with_ttl(b"short", b"v", Duration::from_secs(1))
        .unwrap();
    match client.ttl(b"short").unwrap() {
        ClientTtl::ExpiresIn(_) => {}
        other => panic!("unexpected ttl: {:?}", other),
    }
    std::thread::sleep(Duration::from_millis(1200));
    assert_eq!(client.get(b"short").unwrap(), None);
}

#[test]
fn keys_and_dbsize_reflect_live_keys() {
    let server = TestServer::start();
    let client = server.client();

    assert!(client.keys(b"*").unwrap().is_empty());
    assert_eq!(client.dbsize().unwrap(), 0);

    client.set(b"a", b"1").unwrap();
    client.set(b"b", b"2").unwrap();
    let mut keys = client.keys(b"*").unwrap();
    keys.sort();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(client.dbsize().unwrap(), 2);

    let users = client.keys(b"a*").unwrap();
    assert_eq!(users, vec![b"a".to_vec()]);
}

#[test]
fn scan_walks_the_whole_keyspace() {
    let server = TestServer::start();
    let client = server.client();

    for idx in 0..5u8 {
        client.set(&[b'k', b'0' + idx], b"v").unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor = 0;
    loop {
        let (next, mut page) = client.scan(cursor, 2).unwrap();
        seen.append(&mut page);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    seen.sort();
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[0], b"k0".to_vec());
    assert_eq!(seen[4], b"k4".to_vec());
}

#[test]
fn type_reports_string_or_none() {
    let server = TestServer::start();
    let client = server.client();

    assert_eq!(
        client.command(&[b"TYPE", b"missing"]).unwrap(),
        Value::Simple(b"none".to_vec())
    );
    client.set(b"k", b"v").unwrap();
    assert_eq!(
        client.command(&[b"TYPE", b"k"]).unwrap(),
        Value::Simple(b"string".to_vec())
    );
}

#[test]
fn publish_delivers_to_subscriber() {
    let server = TestServer::start();
    let client = server.client();

    let mut subscriber = client.subscriber().unwrap();
    assert_eq!(subscriber.subscribe(b"news").unwrap(), 1);

    assert_eq!(client.publish(b"news", b"hi").unwrap(), 1);
    let (channel, payload) = subscriber.next_message().unwrap();
    assert_eq!(channel, b"news".to_vec());
    assert_eq!(payload, b"hi".to_vec());
}

#[test]
fn publish_without_subscribers_returns_zero() {
    let server = TestServer::start();
    let client = server.client();
    assert_eq!(client.publish(b"empty", b"hi").unwrap(), 0);
}

#[test]
fn messages_arrive_in_publish_order() {
    let server = TestServer::start();
    let client = server.client();

    let mut subscriber = client.subscriber().unwrap();
    subscriber.subscribe(b"seq").unwrap();

    for idx in 0..20u8 {
        client.publish(b"seq", &[b'm', b'0' + (idx % 10)]).unwrap();
    }
    for idx in 0..20u8 {
        let (_, payload) = subscriber.next_message().unwrap();
        assert_eq!(payload, vec![b'm', b'0' + (idx % 10)]);
    }
}

#[test]
fn large_message_survives_chunked_delivery() {
    let server = TestServer::start();
    let client = server.client();

    let mut subscriber = client.subscriber().unwrap();
    subscriber.subscribe(b"big").unwrap();

    // Well above max_chunk_size, so the frame is split into several
    // sequential writes on the slot.
    let payload: Vec<u8> = (0..20_000usize).map(|idx| (idx % 251) as u8).collect();
    assert_eq!(client.publish(b"big", &payload).unwrap(), 1);

    let (channel, received) = subscriber.next_message().unwrap();
    assert_eq!(channel, b"big".to_vec());
    assert_eq!(received, payload);
}

#[test]
fn unsubscribe_confirmations_count_down() {
    let server = TestServer::start();
    let client = server.client();

    let mut subscriber = client.subscriber().unwrap();
    assert_eq!(subscriber.subscribe(b"a").unwrap(), 1);
    assert_eq!(subscriber.subscribe(b"b").unwrap(), 2);
    assert_eq!(subscriber.unsubscribe(b"a").unwrap(), 1);
    assert_eq!(subscriber.unsubscribe(b"b").unwrap(), 0);
}

#[test]
fn unsubscribe_without_subscriptions_replies_once() {
    let server = TestServer::start();
    let client = server.client();

    let reply = client.command(&[b"UNSUBSCRIBE"]).unwrap();
    assert_eq!(
        reply,
        Value::Array(Some(vec![
            Value::Bulk(Some(b"unsubscribe".to_vec())),
            Value::Bulk(None),
            Value::Integer(0),
        ]))
    );
}

#[test]
fn closed_subscriber_is_removed_from_channel() {
    let server = TestServer::start();
    let client = server.client();

    let mut subscriber = client.subscriber().unwrap();
    subscriber.subscribe(b"news").unwrap();
    assert_eq!(client.publish(b"news", b"one").unwrap(), 1);
    drop(subscriber);

    // The server notices the disconnect and releases the membership; a
    // later publish sees no subscribers again.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if client.publish(b"news", b"two").unwrap() == 0 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "subscriber was never cleaned up"
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn select_auth_and_errors() {
    let server = TestServer::start();
    let client = server.client();

    assert_eq!(
        client.command(&[b"SELECT", b"0"]).unwrap(),
        Value::Simple(b"OK".to_vec())
    );
    match client.command(&[b"SELECT", b"1"]).unwrap() {
        Value::Error(message) => {
            assert_eq!(message, b"ERR DB index is out of range".to_vec())
        }
        other => panic!("unexpected reply: {:?}", other),
    }
    match client.command(&[b"SELECT", b"abc"]).unwrap() {
        Value::Error(message) => {
            assert_eq!(message, b"ERR value is not an integer or out of range".to_vec())
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    assert_eq!(
        client.command(&[b"AUTH", b"whatever"]).unwrap(),
        Value::Simple(b"OK".to_vec())
    );
    match client.command(&[b"AUTH"]).unwrap() {
        Value::Error(message) => {
            assert_eq!(
                message,
                b"ERR wrong number of arguments for 'auth' command".to_vec()
            )
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[test]
fn arity_and_unknown_command_errors() {
    let server = TestServer::start();
    let client = server.client();

    match client.command(&[b"GET"]).unwrap() {
        Value::Error(message) => {
            assert_eq!(
                message,
                b"ERR wrong number of arguments for 'get' command".to_vec()
            )
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    match client.command(&[b"EXPIRE", b"k", b"soon"]).unwrap() {
        Value::Error(message) => {
            assert_eq!(message, b"ERR value is not an integer or out of range".to_vec())
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    match client.command(&[b"NOSUCHCMD", b"a", b"b"]).unwrap() {
        Value::Error(message) => {
            let text = String::from_utf8_lossy(&message).into_owned();
            assert!(text.starts_with("ERR unknown command 'NOSUCHCMD'"), "{text}");
            assert!(text.contains("'a'"), "{text}");
            assert!(text.contains("'b'"), "{text}");
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[test]
fn client_setname_getname_and_list() {
    let server = TestServer::start();
    let client = server.single_connection_client();

    assert_eq!(
        client.command(&[b"CLIENT", b"GETNAME"]).unwrap(),
        Value::Bulk(None)
    );
    assert_eq!(
        client.command(&[b"CLIENT", b"SETNAME", b"worker-1"]).unwrap(),
        Value::Simple(b"OK".to_vec())
    );
    assert_eq!(
        client.command(&[b"CLIENT", b"GETNAME"]).unwrap(),
        Value::Bulk(Some(b"worker-1".to_vec()))
    );

    match client.command(&[b"CLIENT", b"LIST"]).unwrap() {
        Value::Bulk(Some(listing)) => {
            let text = String::from_utf8_lossy(&listing).into_owned();
            assert!(text.contains("name=worker-1"), "{text}");
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    match client.command(&[b"CLIENT", b"PAUSE"]).unwrap() {
        Value::Error(message) => {
            assert_eq!(
                message,
                b"ERR unknown subcommand 'PAUSE'. Try CLIENT HELP.".to_vec()
            )
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[test]
fn info_reports_required_fields() {
    let server = TestServer::start();
    let client = server.client();
    client.set(b"k", b"v").unwrap();

    let info = String::from_utf8(client.info().unwrap()).unwrap();
    for field in [
        "# Server",
        "redis_version:",
        "redis_mode:standalone",
        "tcp_port:",
        "uptime_in_seconds:",
        "uptime_in_days:",
        "# Clients",
        "# Memory",
        "# Stats",
        "# Replication",
        "role:master",
        "connected_slaves:0",
        "# CPU",
        "# Keyspace",
        "db0:keys=1,expires=0,avg_ttl=0",
    ] {
        assert!(info.contains(field), "INFO missing {field}:\n{info}");
    }
}
