// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Technology interfaces.
//!
//! A [`TechnologyModule`] implements multicast over one concrete network
//! technology. The middleware wraps every module instance in a
//! [`TechInterface`], which adds an interface id, a join table shared by
//! all sessions, and a private worker thread so a slow module never
//! stalls a session's I/O thread on the send path.
//!
//! ```text
//!  session I/O threads            worker                   module
//!  join/leave/leave_all ---job--> single-reader queue ---> join/leave
//!  SendJob (Arc) ----------job--> mapping cache      ---> send
//!
//!  module recv thread --ModuleContext::deliver--> join table --> sessions
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Sender};
use parking_lot::{Mutex, RwLock};

use super::registry::EventHub;
use super::session::SessionItem;
use crate::channel::ChannelHandle;
use crate::config::MAX_INBOUND_PACKET_SIZE;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::protocol::{
    InterfaceId, InterfaceProperty, MembershipEvent, MembershipEventType, SocketId,
};
use crate::queue::{single_reader_queue, QueueReader, QueueWriter};
use crate::semaphore::NonblockingStorageSemaphore;
use crate::uri::Uri;

// ============================================================================
// Module trait
// ============================================================================

/// One network technology able to join, leave and send to groups.
///
/// `join`, `leave`, `send` and `map` are only ever called from the
/// owning interface's worker thread; the queries may run concurrently
/// on session threads.
pub trait TechnologyModule: Send + Sync + 'static {
    /// Short technology name (`"loopback"`, `"ip"`, ...).
    fn technology(&self) -> &str;

    /// Hook up the callbacks; called once before any other method.
    fn start(&self, ctx: ModuleContext) -> Result<()>;

    fn join(&self, group: &Uri) -> Result<()>;

    fn leave(&self, group: &Uri) -> Result<()>;

    fn send(&self, group: &Uri, payload: &[u8], ttl: u8) -> Result<()>;

    /// Translate an application group into this technology's namespace.
    fn map(&self, group: &Uri) -> Result<Uri> {
        Ok(group.clone())
    }

    fn neighbor_set(&self) -> Result<Vec<Uri>>;

    /// Known groups with their member counts.
    fn group_set(&self) -> Result<Vec<(Uri, u32)>>;

    fn children_set(&self, group: &Uri) -> Result<Vec<Uri>>;

    fn parent_set(&self, group: &Uri) -> Result<Vec<Uri>>;

    fn designated_host(&self, group: &Uri) -> Result<bool>;

    /// Largest payload sent without fragmentation.
    fn atomic_msg_size(&self) -> u32;

    /// Stop background activity; no callbacks may fire afterwards.
    fn shutdown(&self) {}
}

/// Callbacks a module uses to hand traffic and events to the middleware.
#[derive(Clone)]
pub struct ModuleContext {
    iface_id: InterfaceId,
    joins: Weak<JoinTable>,
    events: Weak<EventHub>,
}

impl ModuleContext {
    pub fn iface_id(&self) -> InterfaceId {
        self.iface_id
    }

    /// A packet arrived on `group` (in the module's namespace).
    pub fn deliver(&self, group: &Uri, data: &[u8]) {
        if let Some(joins) = self.joins.upgrade() {
            joins.handle_receive(group, data);
        }
    }

    /// A membership change happened on `group`.
    pub fn membership_event(&self, group: &Uri, event_type: MembershipEventType) {
        if group.is_empty() {
            log::warn!("interface {}: membership event without group", self.iface_id);
            return;
        }
        if let Some(events) = self.events.upgrade() {
            events.deliver(&MembershipEvent::new(group.clone(), self.iface_id, event_type));
        }
    }
}

// ============================================================================
// Session-facing records
// ============================================================================

/// Subscriber identity of one socket proxy in a join table.
pub struct SocketLink {
    pub(crate) session: ChannelHandle<SessionItem>,
    pub(crate) socket: SocketId,
    pub(crate) receive_budget: Arc<NonblockingStorageSemaphore>,
}

/// A packet to send on every interface of a socket.
///
/// Shared by all interfaces; the session learns that every interface is
/// done with it when the last reference drops.
pub struct SendJob {
    msg: Message,
    group: Uri,
    ttl: u8,
    session: ChannelHandle<SessionItem>,
}

impl SendJob {
    pub(crate) fn new(msg: Message, group: Uri, ttl: u8, session: ChannelHandle<SessionItem>) -> Self {
        Self {
            msg,
            group,
            ttl,
            session,
        }
    }

    pub fn payload(&self) -> &[u8] {
        self.msg.content()
    }
}

impl Drop for SendJob {
    fn drop(&mut self) {
        // Session gone: nothing left to acknowledge.
        let _ = self.session.push(SessionItem::SendDone(self.msg.clone()));
    }
}

// ============================================================================
// Join table
// ============================================================================

/// Mapped group -> subscribed sockets.
#[derive(Default)]
pub(crate) struct JoinTable {
    groups: RwLock<HashMap<Uri, Vec<Arc<SocketLink>>>>,
}

impl JoinTable {
    /// Returns `true` if `who` is the first subscriber of `group`.
    fn add(&self, group: &Uri, who: &Arc<SocketLink>) -> bool {
        let mut groups = self.groups.write();
        let subs = groups.entry(group.clone()).or_default();
        if subs.iter().any(|s| Arc::ptr_eq(s, who)) {
            return false;
        }
        subs.push(Arc::clone(who));
        subs.len() == 1
    }

    /// Returns `true` if `who` was the last subscriber of `group`.
    fn remove(&self, group: &Uri, who: &Arc<SocketLink>) -> bool {
        let mut groups = self.groups.write();
        let Some(subs) = groups.get_mut(group) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| !Arc::ptr_eq(s, who));
        if subs.is_empty() && before > 0 {
            groups.remove(group);
            return true;
        }
        false
    }

    /// Remove `who` everywhere; returns the groups left without members.
    fn remove_all(&self, who: &Arc<SocketLink>) -> Vec<Uri> {
        let mut groups = self.groups.write();
        let mut emptied = Vec::new();
        groups.retain(|group, subs| {
            let before = subs.len();
            subs.retain(|s| !Arc::ptr_eq(s, who));
            if subs.is_empty() && before > 0 {
                emptied.push(group.clone());
                false
            } else {
                true
            }
        });
        emptied
    }

    fn subscribers(&self, group: &Uri) -> Vec<Arc<SocketLink>> {
        self.groups.read().get(group).cloned().unwrap_or_default()
    }

    fn member_counts(&self) -> Vec<(Uri, u32)> {
        let mut counts: Vec<_> = self
            .groups
            .read()
            .iter()
            .map(|(g, subs)| (g.clone(), subs.len() as u32))
            .collect();
        counts.sort();
        counts
    }

    /// Fan a received packet out to every subscriber with budget left.
    fn handle_receive(&self, source: &Uri, data: &[u8]) {
        if data.len() > MAX_INBOUND_PACKET_SIZE {
            log::warn!(
                "packet on {} dropped: {} bytes exceed {}",
                source,
                data.len(),
                MAX_INBOUND_PACKET_SIZE
            );
            return;
        }
        for link in self.subscribers(source) {
            if !link.receive_budget.try_acquire(data.len()) {
                log::warn!("socket {}: receive budget exhausted, packet dropped", link.socket);
                continue;
            }
            let item = SessionItem::Deliver {
                socket: link.socket,
                source: source.clone(),
                data: data.to_vec(),
            };
            if link.session.push(item).is_err() {
                link.receive_budget.release(data.len());
            }
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

type Reply<T> = Sender<Result<T>>;

enum Job {
    Join {
        group: Uri,
        who: Arc<SocketLink>,
        reply: Reply<()>,
    },
    Leave {
        group: Uri,
        who: Arc<SocketLink>,
        reply: Reply<()>,
    },
    LeaveAll {
        who: Arc<SocketLink>,
        reply: Reply<()>,
    },
    Send(Arc<SendJob>),
    Map {
        group: Uri,
        reply: Reply<Uri>,
    },
    Shutdown,
}

struct Worker {
    iface_id: InterfaceId,
    module: Arc<dyn TechnologyModule>,
    joins: Arc<JoinTable>,
    jobs: QueueReader<Job>,
    /// Forward mappings already computed by the module
    mappings: HashMap<Uri, Uri>,
}

impl Worker {
    fn run(mut self) {
        log::debug!("interface {} worker started", self.iface_id);
        loop {
            match self.jobs.pop() {
                Job::Join { group, who, reply } => {
                    let _ = reply.send(self.join(&group, &who));
                }
                Job::Leave { group, who, reply } => {
                    let _ = reply.send(self.leave(&group, &who));
                }
                Job::LeaveAll { who, reply } => {
                    let _ = reply.send(self.leave_all(&who));
                }
                Job::Send(job) => self.send(&job),
                Job::Map { group, reply } => {
                    let _ = reply.send(self.map(&group));
                }
                Job::Shutdown => break,
            }
        }
        log::debug!("interface {} worker stopped", self.iface_id);
    }

    fn map(&mut self, group: &Uri) -> Result<Uri> {
        if let Some(mapped) = self.mappings.get(group) {
            return Ok(mapped.clone());
        }
        let mapped = self.module.map(group)?;
        if mapped.is_empty() {
            return Err(Error::InternalInterfaceError(format!(
                "interface {} cannot map {}",
                self.iface_id, group
            )));
        }
        self.mappings.insert(group.clone(), mapped.clone());
        Ok(mapped)
    }

    fn join(&mut self, group: &Uri, who: &Arc<SocketLink>) -> Result<()> {
        let mapped = self.map(group)?;
        if self.joins.add(&mapped, who) {
            if let Err(e) = self.module.join(&mapped) {
                self.joins.remove(&mapped, who);
                return Err(e);
            }
        }
        Ok(())
    }

    fn leave(&mut self, group: &Uri, who: &Arc<SocketLink>) -> Result<()> {
        let mapped = self.map(group)?;
        if self.joins.remove(&mapped, who) {
            self.module.leave(&mapped)?;
        }
        Ok(())
    }

    fn leave_all(&mut self, who: &Arc<SocketLink>) -> Result<()> {
        let mut result = Ok(());
        for group in self.joins.remove_all(who) {
            if let Err(e) = self.module.leave(&group) {
                log::error!("interface {}: leave {} failed: {}", self.iface_id, group, e);
                result = Err(e);
            }
        }
        result
    }

    fn send(&mut self, job: &SendJob) {
        let outcome = self
            .map(&job.group)
            .and_then(|mapped| self.module.send(&mapped, job.payload(), job.ttl));
        if let Err(e) = outcome {
            log::error!("interface {}: sending to {} failed: {}", self.iface_id, job.group, e);
        }
    }
}

// ============================================================================
// Interface
// ============================================================================

/// A running module instance with its id, join table and worker.
pub struct TechInterface {
    id: InterfaceId,
    name: String,
    address: String,
    module: Arc<dyn TechnologyModule>,
    joins: Arc<JoinTable>,
    jobs: QueueWriter<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TechInterface {
    /// Start `module` as interface `id`.
    pub(crate) fn start(
        id: InterfaceId,
        name: impl Into<String>,
        address: impl Into<String>,
        module: Arc<dyn TechnologyModule>,
        events: &Arc<EventHub>,
    ) -> Result<Self> {
        let joins = Arc::new(JoinTable::default());
        module.start(ModuleContext {
            iface_id: id,
            joins: Arc::downgrade(&joins),
            events: Arc::downgrade(events),
        })?;

        let (jobs, reader) = single_reader_queue();
        let worker = Worker {
            iface_id: id,
            module: Arc::clone(&module),
            joins: Arc::clone(&joins),
            jobs: reader,
            mappings: HashMap::new(),
        };
        let handle = thread::Builder::new()
            .name(format!("hamcast-iface-{}", id))
            .spawn(move || worker.run())?;

        Ok(Self {
            id,
            name: name.into(),
            address: address.into(),
            module,
            joins,
            jobs,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> InterfaceId {
        self.id
    }

    pub fn property(&self) -> InterfaceProperty {
        InterfaceProperty {
            id: self.id,
            name: self.name.clone(),
            address: self.address.clone(),
            technology: self.module.technology().to_string(),
        }
    }

    fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Job) -> Result<T> {
        let (tx, rx) = bounded(1);
        {
            // Jobs queued behind Shutdown would never be answered.
            let worker = self.worker.lock();
            if worker.is_none() {
                return Err(Error::InternalInterfaceError(format!(
                    "interface {} is shut down",
                    self.id
                )));
            }
            self.jobs.push(make(tx));
        }
        rx.recv().map_err(|_| {
            Error::InternalInterfaceError(format!("interface {} is shut down", self.id))
        })?
    }

    /// Subscribe `who` to `group`; the module joins on the first subscriber.
    pub fn join(&self, group: &Uri, who: &Arc<SocketLink>) -> Result<()> {
        self.request(|reply| Job::Join {
            group: group.clone(),
            who: Arc::clone(who),
            reply,
        })
    }

    /// Unsubscribe `who`; the module leaves after the last subscriber.
    pub fn leave(&self, group: &Uri, who: &Arc<SocketLink>) -> Result<()> {
        self.request(|reply| Job::Leave {
            group: group.clone(),
            who: Arc::clone(who),
            reply,
        })
    }

    pub fn leave_all(&self, who: &Arc<SocketLink>) -> Result<()> {
        self.request(|reply| Job::LeaveAll {
            who: Arc::clone(who),
            reply,
        })
    }

    /// Queue a packet; returns immediately.
    pub fn add_job(&self, job: Arc<SendJob>) {
        self.jobs.push(Job::Send(job));
    }

    pub fn mapping_of(&self, group: &Uri) -> Result<Uri> {
        self.request(|reply| Job::Map {
            group: group.clone(),
            reply,
        })
    }

    /// Packets arriving from the module end up here.
    pub fn handle_receive(&self, source: &Uri, data: &[u8]) {
        self.joins.handle_receive(source, data);
    }

    /// Groups with local subscribers and their counts.
    pub fn local_groups(&self) -> Vec<(Uri, u32)> {
        self.joins.member_counts()
    }

    pub fn neighbor_set(&self) -> Result<Vec<Uri>> {
        self.module.neighbor_set()
    }

    pub fn group_set(&self) -> Result<Vec<(Uri, u32)>> {
        self.module.group_set()
    }

    pub fn children_set(&self, group: &Uri) -> Result<Vec<Uri>> {
        self.module.children_set(group)
    }

    pub fn parent_set(&self, group: &Uri) -> Result<Vec<Uri>> {
        self.module.parent_set(group)
    }

    pub fn designated_host(&self, group: &Uri) -> Result<bool> {
        self.module.designated_host(group)
    }

    pub fn atomic_msg_size(&self) -> u32 {
        self.module.atomic_msg_size()
    }

    /// Stop the worker and the module. Idempotent.
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        self.jobs.push(Job::Shutdown);
        if handle.join().is_err() {
            log::error!("interface {} worker panicked", self.id);
        }
        self.module.shutdown();
    }
}

impl fmt::Debug for TechInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TechInterface")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("technology", &self.module.technology())
            .finish()
    }
}

impl Drop for TechInterface {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::SessionSink;
    use std::time::Duration;

    /// Records module-level calls; joins of `ip://fail` are refused.
    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
    }

    impl TechnologyModule for Recording {
        fn technology(&self) -> &str {
            "recording"
        }
        fn start(&self, _ctx: ModuleContext) -> Result<()> {
            Ok(())
        }
        fn join(&self, group: &Uri) -> Result<()> {
            if group.as_str() == "ip://fail" {
                return Err(Error::InternalInterfaceError("refused".into()));
            }
            self.calls.lock().push(format!("join {}", group));
            Ok(())
        }
        fn leave(&self, group: &Uri) -> Result<()> {
            self.calls.lock().push(format!("leave {}", group));
            Ok(())
        }
        fn send(&self, group: &Uri, payload: &[u8], ttl: u8) -> Result<()> {
            self.calls
                .lock()
                .push(format!("send {} {} {}", group, payload.len(), ttl));
            Ok(())
        }
        fn map(&self, group: &Uri) -> Result<Uri> {
            Ok(Uri::new(format!("mapped-{}", group)))
        }
        fn neighbor_set(&self) -> Result<Vec<Uri>> {
            Ok(Vec::new())
        }
        fn group_set(&self) -> Result<Vec<(Uri, u32)>> {
            Ok(Vec::new())
        }
        fn children_set(&self, _group: &Uri) -> Result<Vec<Uri>> {
            Ok(Vec::new())
        }
        fn parent_set(&self, _group: &Uri) -> Result<Vec<Uri>> {
            Ok(Vec::new())
        }
        fn designated_host(&self, _group: &Uri) -> Result<bool> {
            Ok(true)
        }
        fn atomic_msg_size(&self) -> u32 {
            1400
        }
    }

    fn link(sink: &SessionSink, socket: SocketId, budget: usize) -> Arc<SocketLink> {
        Arc::new(SocketLink {
            session: sink.handle(),
            socket,
            receive_budget: Arc::new(NonblockingStorageSemaphore::new(budget)),
        })
    }

    fn start(module: &Arc<Recording>) -> TechInterface {
        let events = Arc::new(EventHub::default());
        let module: Arc<dyn TechnologyModule> = module.clone();
        TechInterface::start(7, "rec0", "10.0.0.1", module, &events).unwrap()
    }

    #[test]
    fn test_module_joins_once_per_group() {
        let module = Arc::new(Recording::default());
        let iface = start(&module);
        let sink = SessionSink::start();
        let (a, b) = (link(&sink, 1, 1024), link(&sink, 2, 1024));
        let group = Uri::from("ip://g");

        iface.join(&group, &a).unwrap();
        iface.join(&group, &b).unwrap();
        iface.join(&group, &a).unwrap();
        assert_eq!(iface.local_groups(), vec![(Uri::from("mapped-ip://g"), 2)]);

        iface.leave(&group, &a).unwrap();
        iface.leave_all(&b).unwrap();
        assert!(iface.local_groups().is_empty());
        assert_eq!(
            *module.calls.lock(),
            vec!["join mapped-ip://g", "leave mapped-ip://g"]
        );
        iface.shutdown();
    }

    #[test]
    fn test_failed_join_is_rolled_back() {
        let module = Arc::new(Recording::default());
        let iface = start(&module);
        let sink = SessionSink::start();
        let a = link(&sink, 1, 1024);

        let err = iface.join(&Uri::from("ip://fail"), &a).unwrap_err();
        assert!(matches!(err, Error::InternalInterfaceError(_)));
        assert!(iface.local_groups().is_empty());
        iface.shutdown();
    }

    #[test]
    fn test_send_job_completion_reaches_session() {
        let module = Arc::new(Recording::default());
        let iface = start(&module);
        let sink = SessionSink::start();

        let msg = Message::async_send(0, 3, 0, vec![9; 5]);
        iface.add_job(Arc::new(SendJob::new(msg, Uri::from("ip://g"), 4, sink.handle())));
        match sink.next(Duration::from_secs(2)) {
            Some(SessionItem::SendDone(done)) => assert_eq!(done.field2(), 3),
            _ => panic!("expected completion"),
        }
        assert_eq!(*module.calls.lock(), vec!["send mapped-ip://g 5 4"]);
        assert_eq!(iface.property().technology, "recording");
        iface.shutdown();
    }

    #[test]
    fn test_receive_respects_budget_and_size() {
        let module = Arc::new(Recording::default());
        let iface = start(&module);
        let sink = SessionSink::start();
        let small = link(&sink, 1, 4);
        let group = Uri::from("ip://g");
        iface.join(&group, &small).unwrap();
        let mapped = iface.mapping_of(&group).unwrap();

        iface.handle_receive(&mapped, b"abc");
        iface.handle_receive(&mapped, b"def");
        iface.handle_receive(&mapped, &vec![0; MAX_INBOUND_PACKET_SIZE + 1]);

        match sink.next(Duration::from_secs(2)) {
            Some(SessionItem::Deliver { socket, data, .. }) => {
                assert_eq!(socket, 1);
                assert_eq!(data, b"abc");
            }
            _ => panic!("expected delivery"),
        }
        assert!(sink.next(Duration::from_millis(100)).is_none());
        assert_eq!(small.receive_budget.acquired(), 3);
        iface.shutdown();
    }
}
