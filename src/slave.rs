// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus slave addressing and multi-slave iteration.

/// Slave identifier
pub type SlaveId = u8;

/// The special address for sending a broadcast message to all
/// connected slaves at once (serial line only). Broadcast messages
/// are one-way; no response is expected.
pub const BROADCAST: SlaveId = 0;

/// The maximum address of a single Modbus slave device.
/// Values above it are reserved by the protocol.
pub const MAX_SLAVE_ID: SlaveId = 247;

/// An ordered set of slave ids with per-slave and per-cycle pacing.
///
/// The set is a 256-bit bitmap plus an iteration cursor. Requests
/// issued against a set are dispatched to each member in increasing
/// id order; [`delay_ms`](Self::set_delay) spaces consecutive members
/// and [`repeat_delay_ms`](Self::set_repeat_delay) spaces full cycles.
/// Without a repeat delay the iteration ends after the highest member.
///
/// A set holding only [`BROADCAST`] together with a repeat delay
/// yields a periodic broadcast schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaveSet {
    mask: [u8; 32],
    delay_ms: u32,
    repeat_ms: Option<u32>,
    active: Option<SlaveId>,
}

impl SlaveSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding a single slave id.
    #[must_use]
    pub fn single(slave: SlaveId) -> Self {
        let mut set = Self::new();
        set.set(slave);
        set
    }

    /// Delay in milliseconds between consecutive slaves of one cycle.
    #[must_use]
    pub fn delay(&self) -> u32 {
        self.delay_ms
    }

    /// Sets the delay between consecutive slaves of one cycle.
    pub fn set_delay(&mut self, delay_ms: u32) {
        self.delay_ms = delay_ms;
    }

    /// Delay in milliseconds between full iteration cycles,
    /// `None` if the iteration does not repeat.
    #[must_use]
    pub fn repeat_delay(&self) -> Option<u32> {
        self.repeat_ms
    }

    /// Sets the delay between full iteration cycles. `None` disables
    /// repetition, i.e. the iteration ends after the highest member.
    pub fn set_repeat_delay(&mut self, repeat_ms: Option<u32>) {
        self.repeat_ms = repeat_ms;
    }

    /// Whether the iteration wraps around after the highest member.
    #[must_use]
    pub fn repeats(&self) -> bool {
        self.repeat_ms.is_some()
    }

    /// Adds a slave id to the set. Ids above [`MAX_SLAVE_ID`] are ignored.
    pub fn set(&mut self, slave: SlaveId) {
        if slave > MAX_SLAVE_ID {
            return;
        }
        self.mask[usize::from(slave) / 8] |= 1 << (slave % 8);
    }

    /// Adds the inclusive id range `begin..=end` to the set.
    /// Invalid ranges are ignored.
    pub fn set_range(&mut self, begin: SlaveId, end: SlaveId) {
        if begin > end || end > MAX_SLAVE_ID {
            return;
        }
        for slave in begin..=end {
            self.set(slave);
        }
    }

    /// Removes a slave id from the set.
    pub fn remove(&mut self, slave: SlaveId) {
        if slave > MAX_SLAVE_ID {
            return;
        }
        self.mask[usize::from(slave) / 8] &= !(1 << (slave % 8));
    }

    /// Tests whether a slave id is a member of the set.
    #[must_use]
    pub fn contains(&self, slave: SlaveId) -> bool {
        if slave > MAX_SLAVE_ID {
            return false;
        }
        self.mask[usize::from(slave) / 8] & (1 << (slave % 8)) != 0
    }

    /// Removes all members and resets cursor and delays.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Whether the set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mask.iter().all(|&byte| byte == 0)
    }

    /// The member the cursor last stopped at, `None` before the
    /// first call to [`next_id`](Self::next_id).
    #[must_use]
    pub fn active(&self) -> Option<SlaveId> {
        self.active
    }

    /// Rewinds the cursor to the beginning of the iteration.
    pub fn reset_cursor(&mut self) {
        self.active = None;
    }

    /// Advances the cursor to the next member and returns it.
    ///
    /// Members are visited in increasing id order. After the highest
    /// member the iteration wraps to the lowest one if a repeat delay
    /// is configured and ends with `None` otherwise.
    pub fn next_id(&mut self) -> Option<SlaveId> {
        let found = self.scan_from(self.start_id());
        if found.is_some() {
            self.active = found;
            return found;
        }
        if self.repeats() {
            let wrapped = self.scan_from(0);
            if wrapped.is_some() {
                self.active = wrapped;
            }
            return wrapped;
        }
        None
    }

    /// Returns the member [`next_id`](Self::next_id) would yield
    /// without moving the cursor.
    #[must_use]
    pub fn peek(&self) -> Option<SlaveId> {
        self.scan_from(self.start_id())
            .or_else(|| if self.repeats() { self.scan_from(0) } else { None })
    }

    /// Whether the iteration can yield further members.
    #[must_use]
    pub fn has_more(&self) -> bool {
        if self.repeats() {
            return !self.is_empty();
        }
        self.scan_from(self.start_id()).is_some()
    }

    fn start_id(&self) -> u16 {
        self.active.map_or(0, |active| u16::from(active) + 1)
    }

    fn scan_from(&self, start: u16) -> Option<SlaveId> {
        (start..=u16::from(MAX_SLAVE_ID))
            .map(|id| id as SlaveId)
            .find(|&id| self.contains(id))
    }
}

impl FromIterator<SlaveId> for SlaveSet {
    fn from_iter<I: IntoIterator<Item = SlaveId>>(iter: I) -> Self {
        let mut set = Self::new();
        for slave in iter {
            set.set(slave);
        }
        set
    }
}

impl Extend<SlaveId> for SlaveSet {
    fn extend<I: IntoIterator<Item = SlaveId>>(&mut self, iter: I) {
        for slave in iter {
            self.set(slave);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_in_increasing_order() {
        let mut set: SlaveSet = [7, 1, 247, 32].into_iter().collect();
        assert_eq!(set.next_id(), Some(1));
        assert_eq!(set.next_id(), Some(7));
        assert_eq!(set.next_id(), Some(32));
        assert_eq!(set.next_id(), Some(247));
        assert_eq!(set.next_id(), None);
        assert_eq!(set.next_id(), None);
    }

    #[test]
    fn wraps_when_repeating() {
        let mut set: SlaveSet = [2, 5].into_iter().collect();
        set.set_repeat_delay(Some(1000));
        assert_eq!(set.next_id(), Some(2));
        assert_eq!(set.next_id(), Some(5));
        assert_eq!(set.next_id(), Some(2));
        assert!(set.has_more());
    }

    #[test]
    fn single_member_repeats_onto_itself() {
        let mut set = SlaveSet::single(BROADCAST);
        set.set_repeat_delay(Some(500));
        assert_eq!(set.next_id(), Some(0));
        assert_eq!(set.next_id(), Some(0));
    }

    #[test]
    fn peek_does_not_advance() {
        let mut set: SlaveSet = [3, 4].into_iter().collect();
        assert_eq!(set.peek(), Some(3));
        assert_eq!(set.peek(), Some(3));
        assert_eq!(set.next_id(), Some(3));
        assert_eq!(set.peek(), Some(4));
    }

    #[test]
    fn range_population() {
        let mut set = SlaveSet::new();
        set.set_range(10, 13);
        assert_eq!((0..=255).filter(|&id| set.contains(id)).count(), 4);
        assert!(set.contains(10));
        assert!(set.contains(13));
        set.set_range(20, 10); // inverted, ignored
        assert!(!set.contains(20));
    }

    #[test]
    fn reserved_ids_are_rejected() {
        let mut set = SlaveSet::new();
        set.set(248);
        set.set(255);
        assert!(set.is_empty());
        assert!(!set.contains(255));
    }

    #[test]
    fn has_more_without_repeat() {
        let mut set = SlaveSet::single(9);
        assert!(set.has_more());
        assert_eq!(set.next_id(), Some(9));
        assert!(!set.has_more());
    }

    #[test]
    fn remove_and_clear() {
        let mut set: SlaveSet = [1, 2].into_iter().collect();
        set.remove(1);
        assert!(!set.contains(1));
        assert!(set.contains(2));
        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.active(), None);
    }
}
