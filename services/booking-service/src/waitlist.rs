// =============================================================================
// WAITLIST QUEUE
// =============================================================================
// Priority-stratified queue of Waitlisted bookings for one schedule.
//
// Active entries in a (train_class, priority) group always carry positions
// 1..=k with no gaps or duplicates. `enqueue` appends at k + 1 and `rerank`
// restores density after entries leave the queue.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{WaitlistEntry, WaitlistPriority};

#[derive(Debug, Clone, Default)]
pub struct WaitlistQueue {
    /// Every entry ever queued on the schedule, active or not
    entries: Vec<WaitlistEntry>,
}

impl WaitlistQueue {
    pub fn new(entries: Vec<WaitlistEntry>) -> Self {
        Self { entries }
    }

    pub fn get(&self, entry_id: Uuid) -> Option<&WaitlistEntry> {
        self.entries.iter().find(|e| e.id == entry_id)
    }

    /// The active entry for a booking, if it is still waiting.
    pub fn active_for_booking(&self, booking_id: Uuid) -> Option<&WaitlistEntry> {
        self.entries
            .iter()
            .find(|e| e.is_active && e.booking_id == booking_id)
    }

    pub fn group_len(&self, train_class: &str, priority: WaitlistPriority) -> usize {
        self.active()
            .filter(|e| e.train_class == train_class && e.priority == priority)
            .count()
    }

    pub fn active_len(&self) -> usize {
        self.active().count()
    }

    fn active(&self) -> impl Iterator<Item = &WaitlistEntry> {
        self.entries.iter().filter(|e| e.is_active)
    }

    /// Append a booking to the back of its stratum.
    pub fn enqueue(
        &mut self,
        booking_id: Uuid,
        schedule_id: Uuid,
        train_class: &str,
        priority: WaitlistPriority,
        now: DateTime<Utc>,
    ) -> WaitlistEntry {
        let position = self.group_len(train_class, priority) as i32 + 1;
        let entry = WaitlistEntry {
            id: Uuid::new_v4(),
            booking_id,
            schedule_id,
            train_class: train_class.to_string(),
            priority,
            position,
            queued_at: now,
            is_active: true,
            confirmed_at: None,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Active entries in service order: priority first, then position.
    pub fn service_order(&self) -> Vec<WaitlistEntry> {
        let mut active: Vec<WaitlistEntry> = self.active().cloned().collect();
        active.sort_by(|a, b| {
            (a.priority, a.position, a.queued_at).cmp(&(b.priority, b.position, b.queued_at))
        });
        active
    }

    /// Active entries served before `entry` on the same class.
    pub fn ahead_of<'a>(&'a self, entry: &'a WaitlistEntry) -> impl Iterator<Item = &'a WaitlistEntry> {
        self.active().filter(move |e| {
            e.id != entry.id
                && e.train_class == entry.train_class
                && (e.priority, e.position) < (entry.priority, entry.position)
        })
    }

    /// Leave the queue by promotion.
    pub fn mark_confirmed(&mut self, entry_id: Uuid, now: DateTime<Utc>) -> bool {
        match self.entries.iter_mut().find(|e| e.id == entry_id && e.is_active) {
            Some(entry) => {
                entry.is_active = false;
                entry.confirmed_at = Some(now);
                true
            }
            None => false,
        }
    }

    /// Leave the queue without a seat (booking cancelled while waiting).
    pub fn deactivate(&mut self, entry_id: Uuid) -> bool {
        match self.entries.iter_mut().find(|e| e.id == entry_id && e.is_active) {
            Some(entry) => {
                entry.is_active = false;
                true
            }
            None => false,
        }
    }

    /// Renumber every stratum to 1..=k by `queued_at` (ties keep their old
    /// relative order). Returns the ids whose position changed.
    pub fn rerank(&mut self) -> Vec<Uuid> {
        let mut groups: BTreeMap<(String, WaitlistPriority), Vec<usize>> = BTreeMap::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.is_active {
                groups
                    .entry((entry.train_class.clone(), entry.priority))
                    .or_default()
                    .push(idx);
            }
        }

        let mut changed = Vec::new();
        for (_, mut indices) in groups {
            indices.sort_by(|a, b| {
                let (ea, eb) = (&self.entries[*a], &self.entries[*b]);
                (ea.queued_at, ea.position).cmp(&(eb.queued_at, eb.position))
            });
            for (rank, idx) in indices.into_iter().enumerate() {
                let position = rank as i32 + 1;
                let entry = &mut self.entries[idx];
                if entry.position != position {
                    entry.position = position;
                    changed.push(entry.id);
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn positions(queue: &WaitlistQueue, priority: WaitlistPriority) -> Vec<i32> {
        let mut p: Vec<i32> = queue
            .service_order()
            .into_iter()
            .filter(|e| e.priority == priority)
            .map(|e| e.position)
            .collect();
        p.sort();
        p
    }

    #[test]
    fn test_enqueue_positions_per_stratum() {
        let mut q = WaitlistQueue::default();
        let schedule = Uuid::new_v4();
        let now = Utc::now();

        let a = q.enqueue(Uuid::new_v4(), schedule, "SL", WaitlistPriority::Regular, now);
        let b = q.enqueue(Uuid::new_v4(), schedule, "SL", WaitlistPriority::SeniorCitizen, now);
        let c = q.enqueue(Uuid::new_v4(), schedule, "SL", WaitlistPriority::Regular, now);

        assert_eq!(a.position, 1);
        assert_eq!(b.position, 1);
        assert_eq!(c.position, 2);
    }

    #[test]
    fn test_service_order_puts_seniors_first() {
        let mut q = WaitlistQueue::default();
        let schedule = Uuid::new_v4();
        let now = Utc::now();

        let regular = q.enqueue(Uuid::new_v4(), schedule, "SL", WaitlistPriority::Regular, now);
        let senior = q.enqueue(
            Uuid::new_v4(),
            schedule,
            "SL",
            WaitlistPriority::SeniorCitizen,
            now + Duration::seconds(1),
        );

        let order: Vec<Uuid> = q.service_order().into_iter().map(|e| e.id).collect();
        assert_eq!(order, vec![senior.id, regular.id]);
    }

    #[test]
    fn test_rerank_closes_gaps_in_queue_order() {
        let mut q = WaitlistQueue::default();
        let schedule = Uuid::new_v4();
        let t0 = Utc::now();

        let first = q.enqueue(Uuid::new_v4(), schedule, "SL", WaitlistPriority::Regular, t0);
        let second = q.enqueue(Uuid::new_v4(), schedule, "SL", WaitlistPriority::Regular, t0 + Duration::seconds(1));
        let third = q.enqueue(Uuid::new_v4(), schedule, "SL", WaitlistPriority::Regular, t0 + Duration::seconds(2));

        assert!(q.mark_confirmed(second.id, t0 + Duration::minutes(5)));
        let changed = q.rerank();

        assert_eq!(changed, vec![third.id]);
        assert_eq!(q.get(first.id).unwrap().position, 1);
        assert_eq!(q.get(third.id).unwrap().position, 2);
        assert_eq!(positions(&q, WaitlistPriority::Regular), vec![1, 2]);
        assert!(q.get(second.id).unwrap().confirmed_at.is_some());
    }

    #[test]
    fn test_deactivate_leaves_confirmed_at_empty() {
        let mut q = WaitlistQueue::default();
        let booking = Uuid::new_v4();
        let entry = q.enqueue(booking, Uuid::new_v4(), "SL", WaitlistPriority::Regular, Utc::now());

        assert!(q.deactivate(entry.id));
        assert!(!q.deactivate(entry.id));
        assert!(q.active_for_booking(booking).is_none());
        assert!(q.get(entry.id).unwrap().confirmed_at.is_none());
        assert_eq!(q.active_len(), 0);
    }

    #[test]
    fn test_ahead_of_counts_higher_priority_and_earlier_positions() {
        let mut q = WaitlistQueue::default();
        let schedule = Uuid::new_v4();
        let now = Utc::now();

        q.enqueue(Uuid::new_v4(), schedule, "SL", WaitlistPriority::Regular, now);
        q.enqueue(Uuid::new_v4(), schedule, "SL", WaitlistPriority::SeniorCitizen, now);
        let me = q.enqueue(Uuid::new_v4(), schedule, "SL", WaitlistPriority::Regular, now);
        q.enqueue(Uuid::new_v4(), schedule, "SL", WaitlistPriority::Regular, now);

        assert_eq!(q.ahead_of(&me).count(), 2);
    }
}
