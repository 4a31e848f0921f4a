//! Streaming output events.
//!
//! The synthesize phase forwards each received token to a [`TokenSink`]
//! immediately. Hosts typically use [`ChannelSink`] and serialize the
//! [`StreamEvent`]s into their transport.

mod sink;

pub use sink::{
    ChannelSink, CollectingSink, ErrorEvent, NoOpSink, SinkClosed, StreamEvent, TokenSink,
};
