//! Per-call RPC stats tracking.
//!
//! The interception hook of an RPC framework calls one of the
//! `StatsHandler::tag_rpc*` methods when a call starts and keeps the returned
//! [`CallStats`] for the rest of the call. Payload events feed the size views
//! immediately; message counts, latency and errors are recorded when the
//! call ends.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use super::{RpcMeasures, Side, KEY_METHOD, KEY_SERVICE, KEY_STATUS};
use crate::stats::{Registry, StatsError};
use crate::tag::{codec, context, TagError, TagSet, MAX_LEN};

/// Errors raised while instrumenting a call.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("malformed RPC method name {0:?}, expected /service/method")]
    MalformedMethod(String),

    #[error("tag error: {0}")]
    Tag(#[from] TagError),

    #[error("stats error: {0}")]
    Stats(#[from] StatsError),
}

/// Lifecycle of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Tagged, no payload seen yet.
    Started,
    /// At least one payload seen.
    Active,
    /// Terminal status recorded.
    Ended,
}

struct HandlerInner {
    registry: Arc<Registry>,
    measures: RpcMeasures,
}

/// Records RPC lifecycle events of one side into the registry.
#[derive(Clone)]
pub struct StatsHandler {
    inner: Arc<HandlerInner>,
}

impl StatsHandler {
    /// Creates a handler and registers the side's measures.
    pub fn new(registry: Arc<Registry>, side: Side) -> Result<Self, StatsError> {
        let measures = RpcMeasures::register(&registry, side)?;
        Ok(Self {
            inner: Arc::new(HandlerInner { registry, measures }),
        })
    }

    pub fn side(&self) -> Side {
        self.inner.measures.side
    }

    pub fn measures(&self) -> &RpcMeasures {
        &self.inner.measures
    }

    /// Registers the side's default views.
    pub fn register_default_views(&self) -> Result<(), StatsError> {
        for view in self.inner.measures.default_views() {
            self.inner.registry.register_view(view)?;
        }
        tracing::info!(side = self.side().as_str(), "rpc views registered");
        Ok(())
    }

    /// Unregisters the side's default views. Views that are not registered
    /// are skipped.
    pub fn unregister_default_views(&self) -> Result<(), StatsError> {
        for view in self.inner.measures.default_views() {
            match self.inner.registry.unregister_view(view.name()) {
                Ok(()) | Err(StatsError::ViewNotRegistered { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Starts a call carrying `scope_tags`. Method and service tags are added
    /// unless the caller already set them.
    pub fn tag_rpc(&self, scope_tags: &TagSet, full_method: &str) -> Result<CallStats, RpcError> {
        let (service, method) = split_method(full_method)?;

        let mut tags = scope_tags.clone();
        tags.insert(KEY_METHOD, method)?;
        tags.insert(KEY_SERVICE, service)?;

        let inner = Arc::clone(&self.inner);
        inner
            .registry
            .record(&tags, &[inner.measures.started_count.m_int(1)])?;

        Ok(CallStats {
            handler: inner,
            tags,
            state: CallState::Started,
            started: Instant::now(),
            request_messages: 0,
            response_messages: 0,
        })
    }

    /// Starts a call from a tag set propagated in binary form.
    pub fn tag_rpc_encoded(&self, encoded: &[u8], full_method: &str) -> Result<CallStats, RpcError> {
        let tags = codec::decode(encoded)?;
        self.tag_rpc(&tags, full_method)
    }

    /// Starts a call with the tag set of the current scope.
    pub fn tag_rpc_current(&self, full_method: &str) -> Result<CallStats, RpcError> {
        self.tag_rpc(&context::current(), full_method)
    }
}

/// Splits `/service/method` into `(service, method)`.
pub fn split_method(full_method: &str) -> Result<(&str, &str), RpcError> {
    let trimmed = full_method.strip_prefix('/').unwrap_or(full_method);
    match trimmed.split_once('/') {
        Some((service, method))
            if !service.is_empty() && !method.is_empty() && !method.contains('/') =>
        {
            Ok((service, method))
        }
        _ => Err(RpcError::MalformedMethod(full_method.to_string())),
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Request,
    Response,
}

/// Stats state of one in-flight call.
///
/// [`CallStats::end`] consumes the call, so no event can follow it.
pub struct CallStats {
    handler: Arc<HandlerInner>,
    tags: TagSet,
    state: CallState,
    started: Instant,
    request_messages: i64,
    response_messages: i64,
}

impl CallStats {
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Tags every measurement of this call is recorded under.
    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// Propagation encoding of the call's tags, for outgoing metadata.
    pub fn encoded_tags(&self) -> Result<Vec<u8>, TagError> {
        codec::encode(&self.tags)
    }

    /// Handles one received payload of `len` bytes.
    pub fn in_payload(&mut self, len: usize) -> Result<(), RpcError> {
        let direction = match self.handler.measures.side {
            Side::Server => Direction::Request,
            Side::Client => Direction::Response,
        };
        self.payload(direction, len)
    }

    /// Handles one sent payload of `len` bytes.
    pub fn out_payload(&mut self, len: usize) -> Result<(), RpcError> {
        let direction = match self.handler.measures.side {
            Side::Server => Direction::Response,
            Side::Client => Direction::Request,
        };
        self.payload(direction, len)
    }

    fn payload(&mut self, direction: Direction, len: usize) -> Result<(), RpcError> {
        self.state = CallState::Active;

        let measures = &self.handler.measures;
        let (measure, messages) = match direction {
            Direction::Request => (&measures.request_bytes, &mut self.request_messages),
            Direction::Response => (&measures.response_bytes, &mut self.response_messages),
        };
        *messages += 1;

        let len = i64::try_from(len).unwrap_or(i64::MAX);
        self.handler
            .registry
            .record(&self.tags, &[measure.m_int(len)])?;

        Ok(())
    }

    /// Ends the call. `error` is the terminal status message of a failed call.
    pub fn end(mut self, error: Option<&str>) -> Result<(), RpcError> {
        self.state = CallState::Ended;

        let measures = &self.handler.measures;
        let registry = &self.handler.registry;
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;

        registry.record(
            &self.tags,
            &[
                measures.request_count.m_int(self.request_messages),
                measures.response_count.m_int(self.response_messages),
                measures.latency.m(elapsed_ms),
                measures.finished_count.m_int(1),
            ],
        )?;

        if let Some(status) = error {
            let mut tags = self.tags.clone();
            tags.upsert(KEY_STATUS, status_value(status))?;
            registry.record(&tags, &[measures.error_count.m_int(1)])?;
        }

        Ok(())
    }
}

impl Drop for CallStats {
    fn drop(&mut self) {
        if self.state != CallState::Ended {
            tracing::warn!(
                side = self.handler.measures.side.as_str(),
                method = self.tags.get(&KEY_METHOD).unwrap_or_default(),
                state = ?self.state,
                "rpc call dropped without end, stats not recorded",
            );
        }
    }
}

/// Maps a status message onto a valid tag value.
fn status_value(status: &str) -> String {
    status
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
        .take(MAX_LEN)
        .collect()
}
