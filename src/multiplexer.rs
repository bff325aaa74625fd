//! Event multiplexer
//!
//! A single `poll(2)` loop waits on every registered keyboard plus the
//! hotplug watch. Ready devices are drained, their reports normalized into
//! [`KeyEvent`]s, and each event is handed to the [`Dispatcher`], which feeds
//! two independent queues:
//!
//! - the counter queue, unbounded, never drops
//! - the click ring, bounded, drops when playback falls behind
//!
//! The loop blocks only inside `poll`, for at most the poll timeout, and
//! checks the shutdown flag after every wakeup.

use crate::audio::ClickProducer;
use crate::device::{DeviceRegistry, HotplugWatch};
use crate::error::CaptureError;
use crate::event::{DeviceId, KeyEvent};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Fans one event stream out to the counter and the click ring
pub struct Dispatcher {
    counter_tx: mpsc::UnboundedSender<KeyEvent>,
    clicks: Option<ClickProducer>,
}

impl Dispatcher {
    pub fn new(counter_tx: mpsc::UnboundedSender<KeyEvent>, clicks: Option<ClickProducer>) -> Self {
        Self { counter_tx, clicks }
    }

    /// Deliver one event. Fails only if the counter consumer is gone.
    pub fn dispatch(&self, event: KeyEvent) -> Result<(), CaptureError> {
        self.counter_tx
            .send(event)
            .map_err(|_| CaptureError::CounterClosed)?;

        if event.is_down() {
            if let Some(ref clicks) = self.clicks {
                clicks.trigger(event.at);
            }
        }
        Ok(())
    }
}

/// The capture loop
pub struct Multiplexer {
    dispatcher: Dispatcher,
    hotplug: Option<HotplugWatch>,
    poll_timeout: Duration,
}

impl Multiplexer {
    pub fn new(dispatcher: Dispatcher, hotplug: Option<HotplugWatch>, poll_timeout: Duration) -> Self {
        Self {
            dispatcher,
            hotplug,
            poll_timeout,
        }
    }

    /// Run until `shutdown` is set.
    ///
    /// Device failures are contained by the registry; only a failing
    /// `poll` or a vanished counter consumer end the loop with an error.
    pub fn run(&mut self, registry: &mut DeviceRegistry, shutdown: &AtomicBool) -> Result<(), CaptureError> {
        let timeout_ms = self.poll_timeout.as_millis().min(i32::MAX as u128) as i32;
        let mut events: Vec<KeyEvent> = Vec::with_capacity(64);

        tracing::debug!(
            "Capture loop running on {} device(s)",
            registry.len()
        );

        loop {
            if shutdown.load(Ordering::Acquire) {
                tracing::debug!("Capture loop stopping");
                return Ok(());
            }

            let targets = registry.poll_targets();
            let mut fds: Vec<libc::pollfd> = targets
                .iter()
                .map(|&(_, fd)| libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();
            if let Some(ref watch) = self.hotplug {
                fds.push(libc::pollfd {
                    fd: watch.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
            }

            // SAFETY: fds is a valid, exclusively borrowed pollfd array of the given length
            let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(CaptureError::Poll(err));
            }

            if shutdown.load(Ordering::Acquire) {
                tracing::debug!("Capture loop stopping");
                return Ok(());
            }
            if ready == 0 {
                continue;
            }

            for (index, &(id, _)) in targets.iter().enumerate() {
                let revents = fds[index].revents;
                if revents == 0 {
                    continue;
                }
                self.service_device(registry, id, revents, &mut events)?;
            }

            if self.hotplug.is_some() && fds.last().map(|p| p.revents != 0).unwrap_or(false) {
                self.service_hotplug(registry);
            }
        }
    }

    fn service_device(
        &self,
        registry: &mut DeviceRegistry,
        id: DeviceId,
        revents: libc::c_short,
        events: &mut Vec<KeyEvent>,
    ) -> Result<(), CaptureError> {
        events.clear();

        if revents & libc::POLLIN != 0 {
            registry.read(id, events);
        } else if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            tracing::debug!("Device {} hung up (revents {:#x})", id, revents);
            registry.remove(id);
        }

        for event in events.drain(..) {
            self.dispatcher.dispatch(event)?;
        }
        Ok(())
    }

    fn service_hotplug(&mut self, registry: &mut DeviceRegistry) {
        let Some(ref mut watch) = self.hotplug else {
            return;
        };
        match watch.drain() {
            Ok(changes) => {
                for change in &changes {
                    tracing::trace!("Hotplug: {:?}", change);
                    registry.apply(change);
                }
            }
            Err(e) => {
                // Keep capturing from the devices we have
                tracing::warn!("Hotplug watch failed, disabling it: {}", e);
                self.hotplug = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Transition;
    use std::time::Instant;

    fn event(code: u16, transition: Transition) -> KeyEvent {
        KeyEvent {
            device: 1,
            code,
            transition,
            at: Instant::now(),
        }
    }

    #[test]
    fn test_dispatch_reaches_counter_queue() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx, None);

        dispatcher.dispatch(event(30, Transition::Down)).unwrap();
        dispatcher.dispatch(event(30, Transition::Up)).unwrap();

        assert_eq!(rx.try_recv().unwrap().transition, Transition::Down);
        assert_eq!(rx.try_recv().unwrap().transition, Transition::Up);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_fails_when_counter_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let dispatcher = Dispatcher::new(tx, None);
        assert!(matches!(
            dispatcher.dispatch(event(30, Transition::Down)),
            Err(CaptureError::CounterClosed)
        ));
    }
}
