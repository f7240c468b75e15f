//! Persistent store for feeds, subscriptions and articles.
//!
//! The store is the single writer of all three entities. Each public
//! operation is its own transaction; typed records ([`Feed`],
//! [`Subscription`], [`Article`]) are built once at this boundary.

mod articles;
mod feeds;
mod schema;
mod subscriptions;
mod types;

pub use schema::{Database, SCHEMA_VERSION};
pub use types::{
    Article, DatabaseError, Feed, FeedFilter, NewArticle, NewSubscription, Subscription,
    SubscriptionFilter, DEFAULT_DESC_LENGTH,
};
