// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Built-in loopback technology: every packet sent to a group is
//! delivered back to the same group on this host.

use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::tech::{ModuleContext, TechnologyModule};
use crate::config::DEFAULT_MAX_MSG_SIZE;
use crate::error::{Error, Result};
use crate::protocol::MembershipEventType;
use crate::queue::{single_reader_queue, QueueReader, QueueWriter};
use crate::uri::Uri;

enum LoopItem {
    Packet { group: Uri, data: Vec<u8> },
    Stop,
}

/// Loopback module with its own delivery thread.
pub struct LoopbackModule {
    ctx: Mutex<Option<ModuleContext>>,
    queue: QueueWriter<LoopItem>,
    reader: Mutex<Option<QueueReader<LoopItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    atomic_msg_size: u32,
}

impl Default for LoopbackModule {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackModule {
    pub fn new() -> Self {
        let (queue, reader) = single_reader_queue();
        Self {
            ctx: Mutex::new(None),
            queue,
            reader: Mutex::new(Some(reader)),
            worker: Mutex::new(None),
            atomic_msg_size: DEFAULT_MAX_MSG_SIZE,
        }
    }

    pub fn with_atomic_msg_size(mut self, size: u32) -> Self {
        self.atomic_msg_size = size;
        self
    }

    fn context(&self) -> Result<ModuleContext> {
        self.ctx
            .lock()
            .clone()
            .ok_or_else(|| Error::InternalInterfaceError("loopback module not started".into()))
    }
}

fn run_delivery(ctx: ModuleContext, mut reader: QueueReader<LoopItem>) {
    loop {
        match reader.pop() {
            LoopItem::Packet { group, data } => {
                log::trace!("loopback {}: {} bytes to {}", ctx.iface_id(), data.len(), group);
                ctx.deliver(&group, &data);
            }
            LoopItem::Stop => break,
        }
    }
}

impl TechnologyModule for LoopbackModule {
    fn technology(&self) -> &str {
        "loopback"
    }

    fn start(&self, ctx: ModuleContext) -> Result<()> {
        let reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| Error::InternalInterfaceError("loopback module already started".into()))?;
        let name = format!("hamcast-loopback-{}", ctx.iface_id());
        *self.ctx.lock() = Some(ctx.clone());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run_delivery(ctx, reader))?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    fn join(&self, group: &Uri) -> Result<()> {
        self.context()?
            .membership_event(group, MembershipEventType::Join);
        Ok(())
    }

    fn leave(&self, group: &Uri) -> Result<()> {
        self.context()?
            .membership_event(group, MembershipEventType::Leave);
        Ok(())
    }

    fn send(&self, group: &Uri, payload: &[u8], _ttl: u8) -> Result<()> {
        if self.worker.lock().is_none() {
            return Err(Error::InternalInterfaceError("loopback module not running".into()));
        }
        self.queue.push(LoopItem::Packet {
            group: group.clone(),
            data: payload.to_vec(),
        });
        Ok(())
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
        Ok(false)
    }

    fn atomic_msg_size(&self) -> u32 {
        self.atomic_msg_size
    }

    fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().take() {
            self.queue.push(LoopItem::Stop);
            let _ = handle.join();
        }
    }
}

impl Drop for LoopbackModule {
    fn drop(&mut self) {
        self.shutdown();
    }
}
