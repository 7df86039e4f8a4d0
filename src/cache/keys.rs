// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache key namespaces and the entity → namespace invalidation table.
//!
//! Every key the service caches starts with one [`CacheNamespace`] prefix.
//! Derived namespaces list the entity types they are computed from in
//! [`CacheNamespace::sources`]; [`INVALIDATION`] is the table consulted on
//! writes, and the tests check that the two agree.

use std::time::Duration;

use crate::entity::EntityType;

/// TTL presets.
pub struct CacheTtl;

impl CacheTtl {
    /// Frequently changing data
    pub const SHORT: Duration = Duration::from_secs(300);
    /// Standard dashboard data
    pub const MEDIUM: Duration = Duration::from_secs(900);
    pub const LONG: Duration = Duration::from_secs(3600);
    /// Historical data
    pub const DAY: Duration = Duration::from_secs(86_400);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheNamespace {
    Metrics,
    Dashboard,
    Contacts,
    Orders,
    Tags,
    Subscriptions,
    Customers,
    Revenue,
    Mrr,
    ContactAnalytics,
    OrderAnalytics,
    TagAnalytics,
    SubscriptionAnalytics,
    /// Per-account last-sync markers; written by the orchestrator itself
    LastSync,
}

impl CacheNamespace {
    pub const ALL: [CacheNamespace; 14] = [
        Self::Metrics,
        Self::Dashboard,
        Self::Contacts,
        Self::Orders,
        Self::Tags,
        Self::Subscriptions,
        Self::Customers,
        Self::Revenue,
        Self::Mrr,
        Self::ContactAnalytics,
        Self::OrderAnalytics,
        Self::TagAnalytics,
        Self::SubscriptionAnalytics,
        Self::LastSync,
    ];

    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Metrics => "metrics:",
            Self::Dashboard => "dashboard:",
            Self::Contacts => "contacts:",
            Self::Orders => "orders:",
            Self::Tags => "tags:",
            Self::Subscriptions => "subscriptions:",
            Self::Customers => "customers:",
            Self::Revenue => "revenue:",
            Self::Mrr => "mrr:",
            Self::ContactAnalytics => "analytics:customers:",
            Self::OrderAnalytics => "analytics:orders:",
            Self::TagAnalytics => "analytics:tags:",
            Self::SubscriptionAnalytics => "analytics:subscriptions:",
            Self::LastSync => "last_sync:",
        }
    }

    /// Entity types this namespace is computed from. Empty for namespaces
    /// that hold no derived data.
    #[must_use]
    pub const fn sources(self) -> &'static [EntityType] {
        use EntityType::*;
        match self {
            Self::Metrics | Self::Dashboard => &[Contact, Order, Tag, Subscription],
            Self::Contacts => &[Contact, Tag],
            Self::Orders | Self::Revenue | Self::OrderAnalytics => &[Order],
            Self::Tags | Self::TagAnalytics => &[Tag],
            Self::Subscriptions | Self::Mrr | Self::SubscriptionAnalytics => &[Subscription],
            Self::Customers | Self::ContactAnalytics => &[Contact],
            Self::LastSync => &[],
        }
    }

    #[must_use]
    pub fn key(self, rest: &str) -> String {
        format!("{}{}", self.prefix(), rest)
    }
}

/// Namespaces to clear after writes of each entity type.
pub const INVALIDATION: [(EntityType, &[CacheNamespace]); 4] = {
    use CacheNamespace::*;
    [
        (
            EntityType::Contact,
            &[Metrics, Dashboard, Contacts, Customers, ContactAnalytics],
        ),
        (
            EntityType::Order,
            &[Metrics, Dashboard, Orders, Revenue, OrderAnalytics],
        ),
        (EntityType::Tag, &[Metrics, Dashboard, Contacts, Tags, TagAnalytics]),
        (
            EntityType::Subscription,
            &[Metrics, Dashboard, Subscriptions, Mrr, SubscriptionAnalytics],
        ),
    ]
};

#[must_use]
pub fn namespaces_for(entity: EntityType) -> &'static [CacheNamespace] {
    INVALIDATION
        .iter()
        .find(|(e, _)| *e == entity)
        .map(|(_, namespaces)| *namespaces)
        .unwrap_or(&[])
}

/// Key builders for the values the service reads and writes.
pub struct CacheKeys;

impl CacheKeys {
    #[must_use]
    pub fn metrics_summary() -> String {
        CacheNamespace::Metrics.key("summary")
    }

    #[must_use]
    pub fn dashboard_main() -> String {
        CacheNamespace::Dashboard.key("main")
    }

    /// `contacts:all`, `orders:all`, ...
    #[must_use]
    pub fn listing(entity: EntityType) -> String {
        Self::listing_namespace(entity).key("all")
    }

    #[must_use]
    pub fn orders_by_date(date: &str) -> String {
        CacheNamespace::Orders.key(&format!("date:{date}"))
    }

    #[must_use]
    pub fn customer_by_id(id: &str) -> String {
        CacheNamespace::Customers.key(&format!("id:{id}"))
    }

    #[must_use]
    pub fn revenue_by_period(period: &str) -> String {
        CacheNamespace::Revenue.key(&format!("period:{period}"))
    }

    #[must_use]
    pub fn entity_stats(entity: EntityType) -> String {
        Self::listing_namespace(entity).key("stats")
    }

    #[must_use]
    pub fn last_sync(account_id: &str) -> String {
        CacheNamespace::LastSync.key(account_id)
    }

    fn listing_namespace(entity: EntityType) -> CacheNamespace {
        match entity {
            EntityType::Contact => CacheNamespace::Contacts,
            EntityType::Order => CacheNamespace::Orders,
            EntityType::Tag => CacheNamespace::Tags,
            EntityType::Subscription => CacheNamespace::Subscriptions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_every_entity_has_an_entry() {
        for entity in EntityType::ALL {
            let namespaces = namespaces_for(entity);
            assert!(namespaces.contains(&CacheNamespace::Metrics), "{entity}");
            assert!(namespaces.contains(&CacheNamespace::Dashboard), "{entity}");
        }
    }

    #[test]
    fn test_table_matches_namespace_sources() {
        for entity in EntityType::ALL {
            let from_table: BTreeSet<_> = namespaces_for(entity).iter().copied().collect();
            let from_sources: BTreeSet<_> = CacheNamespace::ALL
                .into_iter()
                .filter(|ns| ns.sources().contains(&entity))
                .collect();
            assert_eq!(from_table, from_sources, "invalidation table out of date for {entity}");
        }
    }

    #[test]
    fn test_every_derived_namespace_is_invalidated() {
        let covered: BTreeSet<_> = INVALIDATION.iter().flat_map(|(_, ns)| ns.iter().copied()).collect();
        for ns in CacheNamespace::ALL {
            assert_eq!(covered.contains(&ns), !ns.sources().is_empty(), "{:?}", ns);
        }
    }

    #[test]
    fn test_key_builders_use_namespaces() {
        assert_eq!(CacheKeys::metrics_summary(), "metrics:summary");
        assert_eq!(CacheKeys::listing(EntityType::Order), "orders:all");
        assert_eq!(CacheKeys::customer_by_id("9"), "customers:id:9");
        assert_eq!(CacheKeys::last_sync("acct"), "last_sync:acct");

        let built = [
            CacheKeys::dashboard_main(),
            CacheKeys::orders_by_date("2025-01-01"),
            CacheKeys::revenue_by_period("2025-q1"),
            CacheKeys::entity_stats(EntityType::Subscription),
        ];
        for key in built {
            assert!(CacheNamespace::ALL.iter().any(|ns| key.starts_with(ns.prefix())), "{key}");
        }
    }

    #[test]
    fn test_prefixes_are_distinct() {
        let prefixes: BTreeSet<_> = CacheNamespace::ALL.iter().map(|ns| ns.prefix()).collect();
        assert_eq!(prefixes.len(), CacheNamespace::ALL.len());
    }
}
