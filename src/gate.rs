//! Sequence-order gating.
//!
//! A stage is actionable iff it is Pending and every stage with a strictly lower
//! sequence order is Approved. Siblings sharing an order are independent of each
//! other. These functions are pure and evaluated on every read; nothing here is
//! cached, since sibling stages change concurrently.

use chrono::{DateTime, Utc};

use crate::domain::principal::Principal;
use crate::domain::stage::AnyStage;

/// The lowest sequence order that still has a stage not Approved.
///
/// `None` when every stage is Approved (or there are no stages).
pub fn frontier(stages: &[AnyStage]) -> Option<u32> {
    stages
        .iter()
        .filter(|s| !s.is_approved())
        .map(AnyStage::sequence_order)
        .min()
}

/// Whether `stage` may be acted on given the full stage set of its request.
pub fn is_actionable(stage: &AnyStage, stages: &[AnyStage]) -> bool {
    let order = stage.sequence_order();
    stage.is_pending()
        && stages
            .iter()
            .filter(|s| s.sequence_order() < order)
            .all(AnyStage::is_approved)
}

/// Every stage that may be acted on now.
///
/// Once any stage is rejected the request is terminal and nothing is actionable.
pub fn actionable_stages(stages: &[AnyStage]) -> Vec<&AnyStage> {
    if stages.iter().any(AnyStage::is_rejected) {
        return Vec::new();
    }
    let Some(frontier) = frontier(stages) else {
        return Vec::new();
    };
    stages
        .iter()
        .filter(|s| s.sequence_order() == frontier && s.is_pending())
        .collect()
}

/// Actionable stages the principal holds the role and unit for.
pub fn actionable_for<'a>(stages: &'a [AnyStage], principal: &Principal) -> Vec<&'a AnyStage> {
    actionable_stages(stages)
        .into_iter()
        .filter(|s| principal.can_act_on(s.data()))
        .collect()
}

/// When `stage` became actionable: the later of its creation and the last review
/// of any lower-order stage.
pub fn waiting_since(stage: &AnyStage, stages: &[AnyStage]) -> DateTime<Utc> {
    let order = stage.sequence_order();
    stages
        .iter()
        .filter(|s| s.sequence_order() < order)
        .filter_map(AnyStage::reviewed_at)
        .fold(stage.data().created_at, DateTime::max)
}
