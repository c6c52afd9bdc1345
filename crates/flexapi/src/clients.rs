//! Table of client sessions connected to the radio.
//!
//! Populated from `client <handle> connected|disconnected ...` status
//! lines. Written only from the session task; readers take snapshots.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use flexapi_core::{ApiEvent, Error, GuiClient, Property, Result};

use crate::codec::parse_hex_u32;

/// Outcome of applying one `client` status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientChange {
    Added(GuiClient),
    Updated(GuiClient),
    /// `client` is `None` when the handle was never announced.
    Removed {
        handle: u32,
        client: Option<GuiClient>,
        reason: String,
    },
}

/// SmartSDR encodes spaces inside property values as DEL (0x7F).
fn decode_value(value: &str) -> String {
    value.replace('\u{7f}', " ")
}

fn flag(properties: &[Property], key: &str) -> bool {
    properties.iter().any(|(k, v)| k == key && v == "1")
}

fn disconnect_reason(properties: &[Property]) -> String {
    let mut reason = String::from("Disconnected by radio");
    if flag(properties, "forced") {
        reason.push_str(" (forced)");
    }
    if flag(properties, "duplicate_client_id") {
        reason.push_str(" (duplicate client id)");
    }
    if flag(properties, "wan_validation_failed") {
        reason.push_str(" (wan validation failed)");
    }
    reason
}

pub struct ClientTable {
    clients: RwLock<HashMap<u32, GuiClient>>,
    own_handle: RwLock<Option<u32>>,
    events: broadcast::Sender<ApiEvent>,
}

impl ClientTable {
    pub fn new(events: broadcast::Sender<ApiEvent>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            own_handle: RwLock::new(None),
            events,
        }
    }

    /// Set the handle of this session so its record can be flagged.
    pub fn set_own_handle(&self, handle: Option<u32>) {
        *self.own_handle.write() = handle;
    }

    /// Apply the properties of a `client` status line.
    pub fn apply(&self, properties: &[Property]) -> Result<ClientChange> {
        let (handle_token, _) = properties
            .first()
            .ok_or_else(|| Error::Protocol("client status without handle".into()))?;
        let handle = parse_hex_u32(handle_token)
            .ok_or_else(|| Error::Protocol(format!("invalid client handle: {handle_token}")))?;
        let rest = &properties[1..];

        let disconnected = rest
            .first()
            .is_some_and(|(k, v)| k == "disconnected" && v.is_empty());

        if disconnected {
            let client = self.clients.write().remove(&handle);
            let reason = disconnect_reason(rest);
            tracing::debug!(
                handle = format!("{:08X}", handle),
                reason = %reason,
                "Client disconnected"
            );
            if let Some(client) = &client {
                let _ = self.events.send(ApiEvent::GuiClientRemoved(client.clone()));
            }
            return Ok(ClientChange::Removed {
                handle,
                client,
                reason,
            });
        }

        let is_this_client = *self.own_handle.read() == Some(handle);
        let mut clients = self.clients.write();
        let existed = clients.contains_key(&handle);
        let client = clients.entry(handle).or_insert_with(|| GuiClient {
            handle,
            client_id: None,
            program: String::new(),
            station: String::new(),
            is_local_ptt: false,
            is_this_client,
        });

        for (key, value) in rest {
            match key.as_str() {
                "client_id" => client.client_id = Some(value.clone()),
                "program" => client.program = decode_value(value),
                "station" => client.station = decode_value(value),
                "local_ptt" => client.is_local_ptt = value == "1",
                _ => {}
            }
        }
        client.is_this_client = is_this_client;
        let snapshot = client.clone();
        drop(clients);

        if existed {
            let _ = self.events.send(ApiEvent::GuiClientUpdated(snapshot.clone()));
            Ok(ClientChange::Updated(snapshot))
        } else {
            tracing::debug!(
                handle = format!("{:08X}", handle),
                program = %snapshot.program,
                "Client connected"
            );
            let _ = self.events.send(ApiEvent::GuiClientAdded(snapshot.clone()));
            Ok(ClientChange::Added(snapshot))
        }
    }

    pub fn get(&self, handle: u32) -> Option<GuiClient> {
        self.clients.read().get(&handle).cloned()
    }

    /// Snapshot of all known clients, ordered by handle.
    pub fn snapshot(&self) -> Vec<GuiClient> {
        let mut list: Vec<GuiClient> = self.clients.read().values().cloned().collect();
        list.sort_by_key(|c| c.handle);
        list
    }

    /// Remove every client, announcing each removal.
    pub fn clear(&self) {
        let drained: Vec<GuiClient> = self.clients.write().drain().map(|(_, c)| c).collect();
        for client in drained {
            let _ = self.events.send(ApiEvent::GuiClientRemoved(client));
        }
        *self.own_handle.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tokenize_properties;

    fn table() -> (ClientTable, broadcast::Receiver<ApiEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (ClientTable::new(tx), rx)
    }

    #[test]
    fn connect_update_disconnect() {
        let (t, mut rx) = table();
        t.set_own_handle(Some(0x1234));

        let change = t
            .apply(&tokenize_properties(
                "0x00001234 connected client_id=ABC program=SmartSDR-Win station=Shack\u{7f}PC local_ptt=1",
            ))
            .unwrap();
        let ClientChange::Added(client) = change else {
            panic!("expected Added, got {change:?}");
        };
        assert_eq!(client.client_id.as_deref(), Some("ABC"));
        assert_eq!(client.station, "Shack PC");
        assert!(client.is_local_ptt);
        assert!(client.is_this_client);
        assert!(matches!(rx.try_recv(), Ok(ApiEvent::GuiClientAdded(_))));

        let change = t
            .apply(&tokenize_properties("0x00001234 connected local_ptt=0"))
            .unwrap();
        assert!(matches!(change, ClientChange::Updated(ref c) if !c.is_local_ptt));
        assert!(matches!(rx.try_recv(), Ok(ApiEvent::GuiClientUpdated(_))));

        let change = t
            .apply(&tokenize_properties("0x00001234 disconnected forced=1"))
            .unwrap();
        match change {
            ClientChange::Removed {
                handle,
                client,
                reason,
            } => {
                assert_eq!(handle, 0x1234);
                assert_eq!(client.map(|c| c.program).as_deref(), Some("SmartSDR-Win"));
                assert_eq!(reason, "Disconnected by radio (forced)");
            }
            other => panic!("expected Removed, got {other:?}"),
        }
        assert!(matches!(rx.try_recv(), Ok(ApiEvent::GuiClientRemoved(_))));
        assert!(t.snapshot().is_empty());
    }

    #[test]
    fn disconnect_of_unknown_client() {
        let (t, mut rx) = table();
        let change = t
            .apply(&tokenize_properties(
                "0x0000BEEF disconnected forced=0 duplicate_client_id=1",
            ))
            .unwrap();
        assert_eq!(
            change,
            ClientChange::Removed {
                handle: 0xBEEF,
                client: None,
                reason: "Disconnected by radio (duplicate client id)".into(),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_handle() {
        let (t, _rx) = table();
        assert!(t.apply(&tokenize_properties("connected program=x")).is_err());
        assert!(t.apply(&[]).is_err());
    }

    #[test]
    fn clear_announces_removals() {
        let (t, mut rx) = table();
        t.apply(&tokenize_properties("0x1 connected program=A")).unwrap();
        t.apply(&tokenize_properties("0x2 connected program=B")).unwrap();
        while rx.try_recv().is_ok() {}

        t.clear();
        let mut removed = 0;
        while let Ok(ev) = rx.try_recv() {
            assert!(matches!(ev, ApiEvent::GuiClientRemoved(_)));
            removed += 1;
        }
        assert_eq!(removed, 2);
    }
}
