//! Instance/class association and label lifecycle bookkeeping.
//!
//! Tracks, per label: accumulated votes over persistent instance ids and
//! semantic classes, the number of frames the label was observed in, and an
//! age counter scheduling publication. Also owns the per-frame transient
//! instance map rebuilt every frame.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::store::{InstanceId, Label, SemanticClass};

#[derive(Debug, Default)]
pub struct Bookkeeping {
    /// label -> instance id -> accumulated votes.
    instance_votes: BTreeMap<Label, BTreeMap<InstanceId, i32>>,

    /// label -> semantic class -> accumulated votes.
    class_votes: BTreeMap<Label, BTreeMap<SemanticClass, i32>>,

    /// label -> frames in which the label was observed.
    frame_counts: BTreeMap<Label, i32>,

    /// Frame-local instance id -> persistent instance id; transient,
    /// cleared at the end of every frame.
    frame_instances: BTreeMap<InstanceId, InstanceId>,

    /// label -> frames since last touched, for publish scheduling.
    publish_ages: BTreeMap<Label, i32>,
}

impl Bookkeeping {
    // ========================================================================
    // VOTES
    // ========================================================================

    pub fn record_frame(&mut self, label: Label) {
        *self.frame_counts.entry(label).or_insert(0) += 1;
    }

    pub fn frame_count(&self, label: Label) -> i32 {
        self.frame_counts.get(&label).copied().unwrap_or(0)
    }

    pub fn vote_instance(&mut self, label: Label, instance: InstanceId) {
        *self
            .instance_votes
            .entry(label)
            .or_default()
            .entry(instance)
            .or_insert(0) += 1;
    }

    pub fn vote_class(&mut self, label: Label, class: SemanticClass) {
        *self
            .class_votes
            .entry(label)
            .or_default()
            .entry(class)
            .or_insert(0) += 1;
    }

    pub fn instance_votes(&self, label: Label, instance: InstanceId) -> i32 {
        self.instance_votes
            .get(&label)
            .and_then(|votes| votes.get(&instance))
            .copied()
            .unwrap_or(0)
    }

    /// The persistent instance with the most votes for `label` that is not
    /// in `assigned` and whose votes satisfy the sufficiency check
    /// `votes > factor * (frames_seen - votes)`. 0 when none qualifies.
    pub fn best_instance(
        &self,
        label: Label,
        assigned: &BTreeSet<InstanceId>,
        sufficiency_factor: f32,
    ) -> InstanceId {
        let Some(votes) = self.instance_votes.get(&label) else {
            debug!(label, "no instance votes recorded for label");
            return 0;
        };
        let frames = self.frame_count(label);
        let mut best = 0;
        let mut max_votes = 0;
        for (&instance, &count) in votes {
            if instance == 0 || count <= max_votes || assigned.contains(&instance) {
                continue;
            }
            if count as f32 > sufficiency_factor * (frames - count) as f32 {
                best = instance;
                max_votes = count;
            }
        }
        best
    }

    /// The class with the most votes for `label`, if any votes exist.
    /// Lowest class id wins ties (deterministic).
    pub fn best_class(&self, label: Label) -> Option<SemanticClass> {
        let votes = self.class_votes.get(&label)?;
        votes
            .iter()
            .max_by_key(|(&class, &count)| (count, std::cmp::Reverse(class)))
            .map(|(&class, _)| class)
    }

    // ========================================================================
    // PER-FRAME INSTANCE MAP
    // ========================================================================

    pub fn map_frame_instance(&mut self, frame_local: InstanceId, persistent: InstanceId) {
        self.frame_instances.insert(frame_local, persistent);
    }

    pub fn lookup_frame_instance(&self, frame_local: InstanceId) -> Option<InstanceId> {
        self.frame_instances.get(&frame_local).copied()
    }

    pub fn clear_frame_instances(&mut self) {
        self.frame_instances.clear();
    }

    // ========================================================================
    // AGE TRACKING / PUBLISH SCHEDULING
    // ========================================================================

    /// A voxel update touched `label` this frame: restart its clock.
    pub fn reset_age(&mut self, label: Label) {
        self.publish_ages.insert(label, 0);
    }

    pub fn has_publish_age(&self, label: Label) -> bool {
        self.publish_ages.contains_key(&label)
    }

    /// Age every tracked label by one frame and drain those older than
    /// `threshold` as ready to publish.
    pub fn flush_publish_ready(&mut self, threshold: i32) -> Vec<Label> {
        let mut ready = Vec::new();
        self.publish_ages.retain(|&label, age| {
            *age += 1;
            if *age > threshold {
                ready.push(label);
                false
            } else {
                true
            }
        });
        ready
    }

    /// Forget a label retired by a merge: its staged publishing and votes
    /// no longer apply.
    pub fn drop_label(&mut self, label: Label) {
        self.publish_ages.remove(&label);
    }
}
