//! Channel I/O loop: feeds kernel requests to the dispatcher from the event
//! loop without ever blocking it.
//!
//! One cycle waits for the channel to become readable, then drains it with
//! non-blocking receives. Each cycle ends by re-arming (wait again) or by
//! stopping for good once the session is over. A cycle hands at most
//! [`MAX_REQUESTS_PER_DRAIN`] requests to the dispatcher before giving the
//! rest of the runtime a turn.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::request::PendingRequest;

pub const MAX_REQUESTS_PER_DRAIN: usize = 64;

#[derive(Debug)]
pub enum RecvError {
    /// The receive was interrupted; try again immediately.
    Interrupted,
    /// Nothing queued right now.
    WouldBlock,
    /// End of stream: the kernel side is gone.
    Closed,
    Io(io::Error),
}

/// Source of kernel requests.
#[async_trait]
pub trait KernelChannel: Send {
    /// Wait until a receive is likely to succeed.
    async fn readable(&mut self);

    fn try_recv(&mut self) -> Result<PendingRequest, RecvError>;

    fn session_exited(&self) -> bool;
}

/// Consumer of decoded requests.
pub trait RequestHandler {
    fn handle(&self, request: PendingRequest);
}

impl<H: RequestHandler + ?Sized> RequestHandler for Arc<H> {
    fn handle(&self, request: PendingRequest) {
        (**self).handle(request);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Wait for the next readiness event.
    Rearm,
    /// The cycle hit its request limit with more possibly queued.
    Yield,
    Stop,
}

/// Run one drain cycle.
pub fn drain_once<C, H>(channel: &mut C, handler: &H) -> Drain
where
    C: KernelChannel + ?Sized,
    H: RequestHandler + ?Sized,
{
    if channel.session_exited() {
        info!("fuse session exited");
        return Drain::Stop;
    }
    let mut handled = 0usize;
    loop {
        if handled == MAX_REQUESTS_PER_DRAIN {
            debug!(handled, "drain limit reached");
            return Drain::Yield;
        }
        match channel.try_recv() {
            Ok(request) => {
                handler.handle(request);
                handled += 1;
            }
            Err(RecvError::Interrupted) => continue,
            Err(RecvError::WouldBlock) => {
                debug!(handled, "channel drained");
                return Drain::Rearm;
            }
            Err(RecvError::Closed) => {
                info!(handled, "fuse channel closed");
                return Drain::Stop;
            }
            Err(RecvError::Io(e)) => {
                error!(handled, "fuse channel receive failed: {}", e);
                return Drain::Rearm;
            }
        }
    }
}

pub struct ChannelLoop<C, H> {
    channel: C,
    handler: H,
}

impl<C: KernelChannel, H: RequestHandler> ChannelLoop<C, H> {
    pub fn new(channel: C, handler: H) -> Self {
        Self { channel, handler }
    }

    /// Serve requests until the session ends.
    pub async fn run(mut self) {
        loop {
            self.channel.readable().await;
            match drain_once(&mut self.channel, &self.handler) {
                Drain::Rearm => {}
                Drain::Yield => tokio::task::yield_now().await,
                Drain::Stop => break,
            }
        }
        warn!("channel loop stopped");
    }
}
