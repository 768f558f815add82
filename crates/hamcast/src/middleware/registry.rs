// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Interface registry and membership-event fan-out.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::session::SessionItem;
use super::tech::{TechInterface, TechnologyModule};
use crate::channel::ChannelHandle;
use crate::error::{Error, Result};
use crate::protocol::{InterfaceId, InterfaceProperty, MembershipEvent};

/// Sessions that enabled membership events.
#[derive(Default)]
pub struct EventHub {
    subscribers: DashMap<u64, ChannelHandle<SessionItem>>,
}

impl EventHub {
    pub fn subscribe(&self, session: u64, handle: ChannelHandle<SessionItem>) {
        self.subscribers.insert(session, handle);
    }

    pub fn unsubscribe(&self, session: u64) {
        self.subscribers.remove(&session);
    }

    pub fn is_subscribed(&self, session: u64) -> bool {
        self.subscribers.contains_key(&session)
    }

    /// Forward `event` to every subscribed session.
    pub fn deliver(&self, event: &MembershipEvent) {
        log::debug!(
            "event {:?} on {} (interface {})",
            event.event_type,
            event.group,
            event.iface_id
        );
        // Sessions whose channel ended are pruned on the way.
        self.subscribers
            .retain(|_, handle| handle.push(SessionItem::Event(event.clone())).is_ok());
    }
}

/// All technology interfaces of one middleware, keyed by id.
pub struct InterfaceRegistry {
    interfaces: DashMap<InterfaceId, Arc<TechInterface>>,
    next_id: AtomicU32,
    next_session: AtomicU64,
    events: Arc<EventHub>,
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self {
            interfaces: DashMap::new(),
            next_id: AtomicU32::new(1),
            next_session: AtomicU64::new(1),
            events: Arc::new(EventHub::default()),
        }
    }

    /// Start `module` as a new interface and return its id.
    pub fn add(
        &self,
        module: Arc<dyn TechnologyModule>,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Result<InterfaceId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let iface = TechInterface::start(id, name, address, module, &self.events)?;
        log::info!("interface {} up: {:?}", id, iface);
        self.interfaces.insert(id, Arc::new(iface));
        Ok(id)
    }

    pub fn get(&self, id: InterfaceId) -> Result<Arc<TechInterface>> {
        self.interfaces
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::NoSuchInterface(id))
    }

    /// Every interface, ordered by id.
    pub fn all(&self) -> Vec<Arc<TechInterface>> {
        let mut all: Vec<_> = self
            .interfaces
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by_key(|iface| iface.id());
        all
    }

    /// Interface new sockets start on: the one with the lowest id.
    pub fn default_interface(&self) -> Option<Arc<TechInterface>> {
        self.all().into_iter().next()
    }

    pub fn properties(&self) -> Vec<InterfaceProperty> {
        self.all().iter().map(|iface| iface.property()).collect()
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Stop every interface worker and module.
    pub fn shutdown_all(&self) {
        for iface in self.all() {
            iface.shutdown();
        }
        self.interfaces.clear();
    }
}
