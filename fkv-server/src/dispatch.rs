//! # Command Dispatcher
//!
//! Maps the first argument of a parsed command, upper-cased, onto a
//! handler through one static match; every handler documents its reply
//! shape inline. Arity is checked before any state is touched, and every
//! failure becomes a RESP error reply rather than a connection error.

use std::sync::Arc;

use fkv_common::resp;
use fkv_engine::Ttl;

use crate::conn::Connection;
use crate::info;
use crate::pubsub::PublishOptions;
use crate::server::ServerState;
use crate::writer::Priority;

/// Executes one command and returns the complete reply bytes.
pub async fn dispatch(
    state: &Arc<ServerState>,
    connection: &mut Connection,
    args: Vec<Vec<u8>>,
) -> Vec<u8> {
    let name = args[0].to_ascii_uppercase();
    let mut reply = Vec::new();
    match name.as_slice() {
        b"PING" => ping(&args, &mut reply),
        b"AUTH" => auth(&args, &mut reply),
        b"SELECT" => select(&args, &mut reply),
        b"INFO" => info_section(state, &args, &mut reply),
        b"CLIENT" => client(state, connection, &args, &mut reply),
        b"SET" => set(state, &args, &mut reply),
        b"GET" => get(state, &args, &mut reply),
        b"DEL" => del(state, &args, &mut reply),
        b"EXISTS" => exists(state, &args, &mut reply),
        b"TTL" => ttl(state, &args, &mut reply),
        b"EXPIRE" => expire(state, &args, &mut reply),
        b"PERSIST" => persist(state, &args, &mut reply),
        b"KEYS" => keys(state, &args, &mut reply),
        b"SCAN" => scan(state, &args, &mut reply),
        b"DBSIZE" => dbsize(state, &args, &mut reply),
        b"TYPE" => type_of(state, &args, &mut reply),
        b"SUBSCRIBE" => subscribe(state, connection, &args, &mut reply),
        b"UNSUBSCRIBE" => unsubscribe(state, connection, &args, &mut reply),
        b"PUBLISH" => publish(state, &args, &mut reply).await,
        _ => unknown(&args, &mut reply),
    }
    reply
}

fn wrong_args(out: &mut Vec<u8>, command: &str) {
    resp::write_error(
        out,
        &format!("ERR wrong number of arguments for '{command}' command"),
    );
}

fn not_an_integer(out: &mut Vec<u8>) {
    resp::write_error(out, "ERR value is not an integer or out of range");
}

fn syntax_error(out: &mut Vec<u8>) {
    resp::write_error(out, "ERR syntax error");
}

fn parse_i64(data: &[u8]) -> Option<i64> {
    std::str::from_utf8(data).ok()?.trim().parse().ok()
}

fn parse_u64(data: &[u8]) -> Option<u64> {
    std::str::from_utf8(data).ok()?.trim().parse().ok()
}

/// PING → `+PONG`, PING msg → bulk echo.
fn ping(args: &[Vec<u8>], out: &mut Vec<u8>) {
    match args.len() {
        1 => resp::write_simple(out, b"PONG"),
        2 => resp::write_bulk(out, &args[1]),
        _ => wrong_args(out, "ping"),
    }
}

/// AUTH is accepted unconditionally for client compatibility.
fn auth(args: &[Vec<u8>], out: &mut Vec<u8>) {
    match args.len() {
        2 | 3 => resp::write_simple(out, b"OK"),
        _ => wrong_args(out, "auth"),
    }
}

/// Only database 0 exists.
fn select(args: &[Vec<u8>], out: &mut Vec<u8>) {
    if args.len() != 2 {
        return wrong_args(out, "select");
    }
    match parse_i64(&args[1]) {
        Some(0) => resp::write_simple(out, b"OK"),
        Some(_) => resp::write_error(out, "ERR DB index is out of range"),
        None => not_an_integer(out),
    }
}

/// The full INFO block is returned regardless of a requested section.
fn info_section(state: &ServerState, args: &[Vec<u8>], out: &mut Vec<u8>) {
    match args.len() {
        1 | 2 => resp::write_bulk(out, &info::render(state)),
        _ => wrong_args(out, "info"),
    }
}

fn client(state: &ServerState, connection: &Connection, args: &[Vec<u8>], out: &mut Vec<u8>) {
    if args.len() < 2 {
        return wrong_args(out, "client");
    }
    let subcommand = args[1].to_ascii_uppercase();
    match subcommand.as_slice() {
        b"SETNAME" => {
            if args.len() != 3 {
                return wrong_args(out, "client|setname");
            }
            if let Some(meta) = state.clients.lock().get_mut(&connection.id) {
                meta.name = Some(args[2].clone());
            }
            resp::write_simple(out, b"OK");
        }
        b"GETNAME" => {
            if args.len() != 2 {
                return wrong_args(out, "client|getname");
            }
            let name = state
                .clients
                .lock()
                .get(&connection.id)
                .and_then(|meta| meta.name.clone());
            match name {
                Some(name) => resp::write_bulk(out, &name),
                None => resp::write_null_bulk(out),
            }
        }
        b"LIST" => {
            if args.len() != 2 {
                return wrong_args(out, "client|list");
            }
            resp::write_bulk(out, &render_client_list(state));
        }
        _ => {
            resp::write_error(
                out,
                &format!(
                    "ERR unknown subcommand '{}'. Try CLIENT HELP.",
                    String::from_utf8_lossy(&args[1])
                ),
            );
        }
    }
}

fn render_client_list(state: &ServerState) -> Vec<u8> {
    let clients = state.clients.lock();
    let mut entries: Vec<_> = clients.iter().collect();
    entries.sort_by_key(|(id, _)| **id);

    let mut out = String::new();
    for (id, meta) in entries {
        out.push_str(&format!(
            "id={} addr={} name={} age={} sub={}\n",
            id,
            meta.addr,
            meta.name
                .as_deref()
                .map(|name| String::from_utf8_lossy(name).into_owned())
                .unwrap_or_default(),
            meta.created_at.elapsed().as_secs(),
            meta.subscriptions,
        ));
    }
    out.into_bytes()
}

/// SET key value [EX seconds] → `+OK`; SET always clears a prior TTL.
fn set(state: &ServerState, args: &[Vec<u8>], out: &mut Vec<u8>) {
    match args.len() {
        3 => {
            state.store.set(args[1].clone(), args[2].clone());
            resp::write_simple(out, b"OK");
        }
        5 if args[3].eq_ignore_ascii_case(b"EX") => {
            let seconds = match parse_i64(&args[4]) {
                Some(seconds) => seconds,
                None => return not_an_integer(out),
            };
            state.store.set(args[1].clone(), args[2].clone());
            if let Some((deadline, generation)) = state.store.expire(&args[1], seconds) {
                state
                    .store
                    .schedule_expiry(args[1].clone(), deadline, generation);
            }
            resp::write_simple(out, b"OK");
        }
        1 | 2 => wrong_args(out, "set"),
        _ => syntax_error(out),
    }
}

fn get(state: &ServerState, args: &[Vec<u8>], out: &mut Vec<u8>) {
    if args.len() != 2 {
        return wrong_args(out, "get");
    }
    match state.store.get(&args[1]) {
        Some(value) => resp::write_bulk(out, &value),
        None => resp::write_null_bulk(out),
    }
}

/// DEL counts live keys only; stale expiry timers are already defused by
/// the store's generation stamps.
fn del(state: &ServerState, args: &[Vec<u8>], out: &mut Vec<u8>) {
    if args.len() < 2 {
        return wrong_args(out, "del");
    }
    let removed = args[1..]
        .iter()
        .filter(|key| state.store.del(key))
        .count();
    resp::write_integer(out, removed as i64);
}

/// Duplicate keys count multiply, matching Redis.
fn exists(state: &ServerState, args: &[Vec<u8>], out: &mut Vec<u8>) {
    if args.len() < 2 {
        return wrong_args(out, "exists");
    }
    let present = args[1..]
        .iter()
        .filter(|key| state.store.exists(key))
        .count();
    resp::write_integer(out, present as i64);
}

fn ttl(state: &ServerState, args: &[Vec<u8>], out: &mut Vec<u8>) {
    if args.len() != 2 {
        return wrong_args(out, "ttl");
    }
    let value = match state.store.ttl(&args[1]) {
        Ttl::Missing => -2,
        Ttl::NoExpiry => -1,
        // Ceiling of the remaining seconds, so a fresh EXPIRE k 1 reads 1.
        Ttl::ExpiresIn(remaining) => ((remaining.as_millis() + 999) / 1000) as i64,
    };
    resp::write_integer(out, value);
}

fn expire(state: &ServerState, args: &[Vec<u8>], out: &mut Vec<u8>) {
    if args.len() != 3 {
        return wrong_args(out, "expire");
    }
    let seconds = match parse_i64(&args[2]) {
        Some(seconds) => seconds,
        None => return not_an_integer(out),
    };
    match state.store.expire(&args[1], seconds) {
        Some((deadline, generation)) => {
            state
                .store
                .schedule_expiry(args[1].clone(), deadline, generation);
            resp::write_integer(out, 1);
        }
        None => resp::write_integer(out, 0),
    }
}

fn persist(state: &ServerState, args: &[Vec<u8>], out: &mut Vec<u8>) {
    if args.len() != 2 {
        return wrong_args(out, "persist");
    }
    resp::write_integer(out, i64::from(state.store.persist(&args[1])));
}

fn keys(state: &ServerState, args: &[Vec<u8>], out: &mut Vec<u8>) {
    if args.len() != 2 {
        return wrong_args(out, "keys");
    }
    let keys = state.store.keys(&args[1]);
    resp::write_array_header(out, keys.len());
    for key in keys {
        resp::write_bulk(out, &key);
    }
}

/// SCAN cursor [MATCH pattern] [COUNT n] → [next-cursor, [keys...]].
fn scan(state: &ServerState, args: &[Vec<u8>], out: &mut Vec<u8>) {
    if args.len() < 2 {
        return wrong_args(out, "scan");
    }
    let cursor = match parse_u64(&args[1]) {
        Some(cursor) => cursor,
        None => return resp::write_error(out, "ERR invalid cursor"),
    };

    let mut pattern: Option<&[u8]> = None;
    let mut count: usize = 10;
    let mut idx = 2;
    while idx < args.len() {
        let option = args[idx].to_ascii_uppercase();
        match option.as_slice() {
            b"MATCH" if idx + 1 < args.len() => {
                pattern = Some(&args[idx + 1]);
                idx += 2;
            }
            b"COUNT" if idx + 1 < args.len() => {
                match parse_u64(&args[idx + 1]) {
                    Some(value) if value > 0 => count = value as usize,
                    Some(_) => return syntax_error(out),
                    None => return not_an_integer(out),
                }
                idx += 2;
            }
            _ => return syntax_error(out),
        }
    }

    let (next_cursor, page) = state.store.scan(cursor, pattern, count);
    resp::write_array_header(out, 2);
    resp::write_bulk(out, next_cursor.to_string().as_bytes());
    resp::write_array_header(out, page.len());
    for key in page {
        resp::write_bulk(out, &key);
    }
}

fn dbsize(state: &ServerState, args: &[Vec<u8>], out: &mut Vec<u8>) {
    if args.len() != 1 {
        return wrong_args(out, "dbsize");
    }
    resp::write_integer(out, state.store.len() as i64);
}

/// Only string values exist, so TYPE is `string` or `none`.
fn type_of(state: &ServerState, args: &[Vec<u8>], out: &mut Vec<u8>) {
    if args.len() != 2 {
        return wrong_args(out, "type");
    }
    if state.store.exists(&args[1]) {
        resp::write_simple(out, b"string");
    } else {
        resp::write_simple(out, b"none");
    }
}

/// One `["subscribe", channel, count]` array per channel, where count is
/// the connection's total subscription count after each addition.
fn subscribe(
    state: &ServerState,
    connection: &mut Connection,
    args: &[Vec<u8>],
    out: &mut Vec<u8>,
) {
    if args.len() < 2 {
        return wrong_args(out, "subscribe");
    }
    for channel in &args[1..] {
        connection.subscribe(channel);
        state
            .broker
            .subscribe(connection.id, channel, Priority::Normal);
        resp::write_array_header(out, 3);
        resp::write_bulk(out, b"subscribe");
        resp::write_bulk(out, channel);
        resp::write_integer(out, connection.subscription_count() as i64);
    }
    sync_subscription_meta(state, connection);
}

/// Without arguments, every current subscription is dropped. A connection
/// with nothing to drop still gets one confirmation array.
fn unsubscribe(
    state: &ServerState,
    connection: &mut Connection,
    args: &[Vec<u8>],
    out: &mut Vec<u8>,
) {
    let channels: Vec<Vec<u8>> = if args.len() > 1 {
        args[1..].to_vec()
    } else {
        connection.subscribed_channels()
    };

    if channels.is_empty() {
        resp::write_array_header(out, 3);
        resp::write_bulk(out, b"unsubscribe");
        resp::write_null_bulk(out);
        resp::write_integer(out, 0);
        return;
    }

    for channel in &channels {
        connection.unsubscribe(channel);
        state.broker.unsubscribe(connection.id, channel);
        resp::write_array_header(out, 3);
        resp::write_bulk(out, b"unsubscribe");
        resp::write_bulk(out, channel);
        resp::write_integer(out, connection.subscription_count() as i64);
    }
    sync_subscription_meta(state, connection);
}

fn sync_subscription_meta(state: &ServerState, connection: &Connection) {
    if let Some(meta) = state.clients.lock().get_mut(&connection.id) {
        meta.subscriptions = connection.subscription_count();
    }
}

async fn publish(state: &Arc<ServerState>, args: &[Vec<u8>], out: &mut Vec<u8>) {
    if args.len() != 3 {
        return wrong_args(out, "publish");
    }
    let delivered = state
        .broker
        .publish(&state.om, &args[1], &args[2], PublishOptions::default())
        .await;
    state.metrics.record_publish(delivered as u64);
    resp::write_integer(out, delivered as i64);
}

fn unknown(args: &[Vec<u8>], out: &mut Vec<u8>) {
    let mut preview = String::new();
    for arg in args.iter().skip(1).take(3) {
        preview.push_str(&format!("'{}', ", String::from_utf8_lossy(arg)));
    }
    resp::write_error(
        out,
        &format!(
            "ERR unknown command '{}', with args beginning with: {}",
            String::from_utf8_lossy(&args[0]),
            preview
        ),
    );
}
