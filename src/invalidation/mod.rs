//! Entity-shaped invalidation routines.
//!
//! Each routine knows the key shapes and tags one kind of entity is cached
//! under and removes them with [`Cache`] primitives only. Write paths call
//! [`Invalidator::invalidate_on_update`] and never touch keys themselves.
//!
//! Nothing here is atomic: a routine is a sequence of independent deletes and
//! tag invalidations, each fail-open like the rest of the cache.

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::cache::{
    Cache,
    keys::{self, prefix, tags},
};

/// Subject of the featured-templates list key, `template:featured`.
pub const FEATURED_TEMPLATES: &str = "featured";

/// Kinds of entity a write path can report as changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Roadmap,
    Template,
    Achievement,
    Resource,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Roadmap => "roadmap",
            Self::Template => "template",
            Self::Achievement => "achievement",
            Self::Resource => "resource",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity kind `{0}`")]
pub struct UnknownEntityKind(pub String);

impl FromStr for EntityKind {
    type Err = UnknownEntityKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "roadmap" => Ok(Self::Roadmap),
            "template" => Ok(Self::Template),
            "achievement" => Ok(Self::Achievement),
            "resource" => Ok(Self::Resource),
            _ => Err(UnknownEntityKind(s.to_owned())),
        }
    }
}

/// One entry of an [`Invalidator::batch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invalidation {
    pub kind: EntityKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

impl Invalidation {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            owner_id: None,
        }
    }

    #[must_use]
    pub fn owned_by(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }
}

/// Named invalidation routines over a shared [`Cache`].
///
/// Every routine returns how many cache entries it removed; `0` also covers
/// the case where the store was unreachable.
#[derive(Debug, Clone)]
pub struct Invalidator {
    cache: Arc<Cache>,
}

impl Invalidator {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// The known keys of `prefix:subject`, everything else under
    /// `prefix:subject:*`, and everything tagged with any of `tag_names`.
    ///
    /// The exact deletes work on any store; the pattern delete only where the
    /// store can enumerate, and never for a subject holding glob characters.
    async fn drop_entity(&self, prefix: &str, subject: &str, tag_names: Vec<String>) -> u64 {
        let exact = self.cache.delete_many(&keys::known_keys(prefix, subject)).await;
        let by_pattern = match keys::subtree(prefix, subject) {
            Some(pattern) => self.cache.delete_pattern(&pattern).await,
            None => {
                warn!(cache = "invalidator", prefix, subject, "subject contains glob characters; skipping pattern delete");
                0
            }
        };
        let by_tag = self.cache.invalidate_by_tags(&tag_names).await as u64;
        exact + by_pattern + by_tag
    }

    /// A user's profile, settings and other `user:<id>:*` entries.
    pub async fn invalidate_user(&self, user_id: &str) -> u64 {
        self.drop_entity(prefix::USER, user_id, vec![tags::user(user_id)])
            .await
    }

    /// A roadmap and its steps; with an owner, also the owner's roadmap list
    /// and analytics, which summarize roadmap progress.
    pub async fn invalidate_roadmap(&self, roadmap_id: &str, owner_id: Option<&str>) -> u64 {
        let mut removed = self
            .drop_entity(prefix::ROADMAP, roadmap_id, vec![tags::roadmap(roadmap_id)])
            .await;
        if let Some(owner_id) = owner_id {
            let list = keys::build(prefix::USER, owner_id, &["roadmaps"]);
            removed += u64::from(self.cache.delete(&list).await);
            removed += self.invalidate_analytics(owner_id).await;
        }
        removed
    }

    /// A template and every list that may include it.
    pub async fn invalidate_template(&self, template_id: &str) -> u64 {
        self.drop_entity(
            prefix::TEMPLATE,
            template_id,
            vec![tags::template(template_id), tags::TEMPLATE_LISTS.to_owned()],
        )
        .await
    }

    /// The featured list is stored without expiry, so it only changes here.
    pub async fn invalidate_featured_templates(&self) -> u64 {
        let key = keys::build(prefix::TEMPLATE, FEATURED_TEMPLATES, &[]);
        let removed = u64::from(self.cache.delete(&key).await);
        removed
            + self
                .cache
                .invalidate_by_tags(&[tags::TEMPLATE_LISTS.to_owned()])
                .await as u64
    }

    /// Every analytics window computed for a user.
    pub async fn invalidate_analytics(&self, user_id: &str) -> u64 {
        self.drop_entity(prefix::ANALYTICS, user_id, vec![tags::analytics(user_id)])
            .await
    }

    pub async fn invalidate_resource_category(&self, category: &str) -> u64 {
        self.drop_entity(prefix::RESOURCE, category, vec![tags::resource_category(category)])
            .await
    }

    /// A user's achievement set and progress.
    pub async fn invalidate_achievements(&self, user_id: &str) -> u64 {
        self.drop_entity(prefix::ACHIEVEMENT, user_id, vec![tags::achievements(user_id)])
            .await
    }

    /// Data scoped to a publishing platform, such as its trend listings.
    pub async fn invalidate_platform(&self, platform: &str) -> u64 {
        self.drop_entity(prefix::PLATFORM, platform, vec![tags::platform(platform)])
            .await
    }

    /// Routes a change notification to the matching routine.
    ///
    /// For [`EntityKind::Achievement`] the cached set belongs to a user, so
    /// `owner_id` is used when present and `id` otherwise. For
    /// [`EntityKind::Resource`] `id` is the resource category.
    #[instrument(skip(self, kind), fields(kind = %kind))]
    pub async fn invalidate_on_update(&self, kind: EntityKind, id: &str, owner_id: Option<&str>) -> u64 {
        let removed = match kind {
            EntityKind::User => self.invalidate_user(id).await,
            EntityKind::Roadmap => self.invalidate_roadmap(id, owner_id).await,
            EntityKind::Template => {
                self.invalidate_template(id).await + self.invalidate_featured_templates().await
            }
            EntityKind::Achievement => self.invalidate_achievements(owner_id.unwrap_or(id)).await,
            EntityKind::Resource => self.invalidate_resource_category(id).await,
        };
        debug!(cache = "invalidator", %kind, id, removed, "invalidated");
        removed
    }

    /// Runs every dispatch concurrently and waits for all of them.
    ///
    /// Best effort: entities are invalidated independently and a failure in
    /// one does not stop the rest. Returns the total number of entries removed.
    pub async fn batch(&self, invalidations: Vec<Invalidation>) -> u64 {
        let mut tasks = JoinSet::new();
        for invalidation in invalidations {
            let invalidator = self.clone();
            tasks.spawn(async move {
                invalidator
                    .invalidate_on_update(
                        invalidation.kind,
                        &invalidation.id,
                        invalidation.owner_id.as_deref(),
                    )
                    .await
            });
        }

        let mut total = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(removed) => total += removed,
                Err(error) => warn!(cache = "invalidator", %error, "invalidation task failed"),
            }
        }
        total
    }
}
