//! Durable event bus on Redis streams.
//!
//! Every subject is a capped stream (`<namespace>:<subject>`) shared by all
//! nodes connected to the same Redis. Consumers are Redis consumer groups,
//! so their cursors and pending entries live on the server: a member that
//! goes away leaves its group intact and the next member resumes where the
//! last one stopped.
//!
//! Two consumption modes are offered by [`BusClient`]:
//!
//! * **plain** ([`BusClient::subscribe`]): the group is named
//!   `<durable>-<node_id>`, so every node sees every event once. A new plain
//!   group starts at the end of the stream.
//! * **queue group** ([`BusClient::queue_subscribe`]): all members that share
//!   a durable name split the stream, each event is handled by one of them.
//!   A new queue group starts at the oldest retained entry.
//!
//! A handler returning `Ok` acks the entry (`XACK`). An `Err` naks it: the
//! entry stays pending and is reclaimed (`XCLAIM`) after a backoff, up to
//! `max_deliver` deliveries. Entries left pending by a member that died are
//! reclaimed the same way once they have been idle for `ack_wait`.

mod broker;
mod error;
mod subscription;

pub use broker::{Broker, BrokerConfig, BusClient, Delivery};
pub use error::BusError;
pub use subscription::Subscription;
