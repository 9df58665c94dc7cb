use athanor_core::config::SubscriptionOptions;
use athanor_core::error::{AthanorError, Result};
use athanor_core::traits::{Subscription, SubscriptionSource};
use athanor_core::types::ShardName;
use std::collections::BTreeSet;

/// An async subscription and the handler that drives it
#[derive(Clone)]
pub struct SubscriptionRegistration {
    pub options: SubscriptionOptions,
    pub source: SubscriptionSource,
}

impl SubscriptionRegistration {
    pub fn identity(&self) -> String {
        self.options.shard_name().identity()
    }
}

struct InlineProjection {
    identity: String,
    database: Option<String>,
}

/// Everything that claims a shard identity in one store
///
/// Inline projections are applied by the writer, not the daemon, but they
/// share the identity namespace with async subscriptions.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inline: Vec<InlineProjection>,
    subscriptions: Vec<SubscriptionRegistration>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_inline(&mut self, shard: ShardName) -> &mut Self {
        self.inline.push(InlineProjection {
            identity: shard.identity(),
            database: None,
        });
        self
    }

    pub fn register_inline_for(
        &mut self,
        shard: ShardName,
        database: impl Into<String>,
    ) -> &mut Self {
        self.inline.push(InlineProjection {
            identity: shard.identity(),
            database: Some(database.into()),
        });
        self
    }

    pub fn register(&mut self, options: SubscriptionOptions, source: SubscriptionSource) -> &mut Self {
        self.subscriptions
            .push(SubscriptionRegistration { options, source });
        self
    }

    /// Register a single shared handler instance
    pub fn subscribe<S>(&mut self, options: SubscriptionOptions, subscription: S) -> &mut Self
    where
        S: Subscription + 'static,
    {
        self.register(options, SubscriptionSource::instance(subscription))
    }

    pub fn len(&self) -> usize {
        self.inline.len() + self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn registrations(&self) -> &[SubscriptionRegistration] {
        &self.subscriptions
    }

    /// Async subscriptions that run against `database`
    pub fn for_database(&self, database: &str) -> Vec<&SubscriptionRegistration> {
        self.subscriptions
            .iter()
            .filter(|r| r.options.applies_to(database))
            .collect()
    }

    /// Fail on invalid options or on any identity claimed twice in
    /// overlapping database scopes
    pub fn validate(&self) -> Result<()> {
        for registration in &self.subscriptions {
            registration.options.validate()?;
        }

        let claims: Vec<(String, Option<&str>)> = self
            .inline
            .iter()
            .map(|p| (p.identity.clone(), p.database.as_deref()))
            .chain(
                self.subscriptions
                    .iter()
                    .map(|r| (r.identity(), r.options.database.as_deref())),
            )
            .collect();

        let mut duplicates = BTreeSet::new();
        for (i, (identity, database)) in claims.iter().enumerate() {
            for (other, other_database) in &claims[i + 1..] {
                if identity == other && scopes_overlap(*database, *other_database) {
                    duplicates.insert(identity.clone());
                }
            }
        }

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(AthanorError::DuplicateSubscriptionNames(
                duplicates.into_iter().collect(),
            ))
        }
    }
}

fn scopes_overlap(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}
