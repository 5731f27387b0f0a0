//! Central event queue for the cartridge timeline.
//!
//! Only three event kinds exist and the bus never has more than one of each
//! pending, so there is no general priority queue here: the queue is one
//! deadline slot per event kind, scanned on pop. Ties fire in declaration
//! order, which keeps a data word delivered before the transfer that
//! produced it is torn down.

use nds_common::savestate::{SavestateReader, SavestateWriter, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    RomPrepareData = 0,
    RomEndTransfer,
    RomSpiDone,
}

impl SchedulerEvent {
    pub const ALL: [Self; 3] = [Self::RomPrepareData, Self::RomEndTransfer, Self::RomSpiDone];
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    // Absolute cycle each event kind fires at; None when not scheduled
    deadlines: [Option<u64>; SchedulerEvent::ALL.len()],
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `event` at `cycles`, replacing any pending deadline for it.
    pub fn insert_or_update(&mut self, event: SchedulerEvent, cycles: u64) {
        log::trace!("Scheduling event {event:?} at cycles {cycles}");

        self.deadlines[event as usize] = Some(cycles);
    }

    pub fn remove(&mut self, event: SchedulerEvent) {
        log::trace!("Cancelling event {event:?}");

        self.deadlines[event as usize] = None;
    }

    #[must_use]
    pub fn is_event_ready(&self, cycles: u64) -> bool {
        self.deadlines.iter().flatten().any(|&deadline| deadline <= cycles)
    }

    /// Takes the earliest event due at or before `cycles`, if any.
    pub fn pop(&mut self, cycles: u64) -> Option<(SchedulerEvent, u64)> {
        let mut due: Option<(SchedulerEvent, u64)> = None;
        for event in SchedulerEvent::ALL {
            if let Some(deadline) = self.deadlines[event as usize] {
                if deadline <= cycles && due.is_none_or(|(_, earliest)| deadline < earliest) {
                    due = Some((event, deadline));
                }
            }
        }

        let (event, deadline) = due?;
        self.deadlines[event as usize] = None;

        log::trace!("Popped event {event:?} at cycles {deadline}");

        Some((event, deadline))
    }
}

impl Snapshot for Scheduler {
    fn save(&mut self, file: &mut SavestateWriter<'_>) {
        file.section(*b"SCHD");

        for deadline in self.deadlines {
            file.bool32(deadline.is_some());
            file.var_u64(deadline.unwrap_or(0));
        }
    }

    fn load(&mut self, file: &mut SavestateReader<'_>) {
        file.section(*b"SCHD");

        for deadline in &mut self.deadlines {
            let scheduled = file.bool32();
            let cycles = file.var_u64();
            *deadline = scheduled.then_some(cycles);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_cycle_order() {
        let mut scheduler = Scheduler::new();
        scheduler.insert_or_update(SchedulerEvent::RomEndTransfer, 300);
        scheduler.insert_or_update(SchedulerEvent::RomPrepareData, 100);
        scheduler.insert_or_update(SchedulerEvent::RomSpiDone, 200);

        assert!(!scheduler.is_event_ready(99));
        assert_eq!(scheduler.pop(500), Some((SchedulerEvent::RomPrepareData, 100)));
        assert_eq!(scheduler.pop(500), Some((SchedulerEvent::RomSpiDone, 200)));
        assert_eq!(scheduler.pop(500), Some((SchedulerEvent::RomEndTransfer, 300)));
        assert_eq!(scheduler.pop(500), None);
    }

    #[test]
    fn pop_only_takes_due_events() {
        let mut scheduler = Scheduler::new();
        scheduler.insert_or_update(SchedulerEvent::RomPrepareData, 100);
        scheduler.insert_or_update(SchedulerEvent::RomEndTransfer, 300);

        assert_eq!(scheduler.pop(200), Some((SchedulerEvent::RomPrepareData, 100)));
        assert_eq!(scheduler.pop(200), None);
        assert_eq!(scheduler.pop(300), Some((SchedulerEvent::RomEndTransfer, 300)));
    }

    #[test]
    fn ties_fire_in_declaration_order() {
        let mut scheduler = Scheduler::new();
        scheduler.insert_or_update(SchedulerEvent::RomEndTransfer, 100);
        scheduler.insert_or_update(SchedulerEvent::RomPrepareData, 100);

        assert_eq!(scheduler.pop(100), Some((SchedulerEvent::RomPrepareData, 100)));
        assert_eq!(scheduler.pop(100), Some((SchedulerEvent::RomEndTransfer, 100)));
    }

    #[test]
    fn update_reschedules() {
        let mut scheduler = Scheduler::new();
        scheduler.insert_or_update(SchedulerEvent::RomPrepareData, 100);
        scheduler.insert_or_update(SchedulerEvent::RomPrepareData, 400);

        assert_eq!(scheduler.pop(100), None);
        assert_eq!(scheduler.pop(400), Some((SchedulerEvent::RomPrepareData, 400)));
    }

    #[test]
    fn remove_cancels() {
        let mut scheduler = Scheduler::new();
        scheduler.insert_or_update(SchedulerEvent::RomPrepareData, 100);
        scheduler.remove(SchedulerEvent::RomPrepareData);

        assert_eq!(scheduler.pop(u64::MAX), None);
        assert!(!scheduler.is_event_ready(u64::MAX));
    }
}
