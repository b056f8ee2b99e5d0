//! Presence tracking: which connections are currently bound to which
//! username, so `Store::send` can answer its `online?(recipient)`
//! predicate (spec §4.D). Grounded in the original system's
//! `connected_clients` dict (`server/handler.py`), which maps a client's
//! socket address to the username bound to it; a recipient counts as
//! online if it appears anywhere in that dict's values.
//!
//! A connection's address is bound on `LOGIN_1` and re-bound on every
//! `PING` (spec §6 R09 — "(re)binds a connection's username"), and
//! unbound when the connection closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

/// Address -> username bindings for every currently connected client on
/// this node.
pub struct Presence {
    by_addr: Mutex<HashMap<SocketAddr, String>>,
}

impl Presence {
    pub fn new() -> Self {
        Self { by_addr: Mutex::new(HashMap::new()) }
    }

    /// Binds `addr` to `username`, marking it online.
    pub fn bind(&self, addr: SocketAddr, username: impl Into<String>) {
        self.by_addr.lock().unwrap().insert(addr, username.into());
    }

    /// Unbinds `addr`, called when its connection closes.
    pub fn disconnect(&self, addr: SocketAddr) {
        self.by_addr.lock().unwrap().remove(&addr);
    }

    /// True if some currently connected address is bound to `username`.
    pub fn is_online(&self, username: &str) -> bool {
        self.by_addr.lock().unwrap().values().any(|bound| bound == username)
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}
