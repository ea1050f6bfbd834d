//! Angio tracing
//!
//! Follows causal chains of work ("dyes") through tasks and messages.
//! Each task carries a dye; sends derive a new dye from the sender's,
//! receives end the receiver's trace and adopt the message's dye.
//!
//! Design:
//! - A dye is a base name, an occurrence number per base name and a
//!   serial number unique across the run
//! - One line per event: `W base occ serial ! T task tsn ! time ! E event`
//! - Lines are kept in order and echoed on target `parasol::angio`
//! - Kernel helper tasks never log

use std::collections::HashMap;
use std::rc::Rc;

use super::error::SyscallResult;
use super::task::TaskId;
use super::Kernel;

/// Identity of one causal chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dye {
    pub base: Rc<str>,
    pub occurrence: u64,
    pub serial: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Angio {
    /// Whether events are written; dyes are tracked either way
    pub output: bool,
    occurrences: HashMap<Rc<str>, u64>,
    next_serial: u64,
    lines: Vec<String>,
}

impl Angio {
    pub fn new() -> Self {
        Self {
            output: true,
            ..Self::default()
        }
    }

    /// Fresh chain; the first use of a base name is occurrence 0
    pub fn create_dye(&mut self, base: &str) -> Dye {
        let (base, occurrence) = match self.occurrences.get_key_value(base) {
            Some((name, &count)) => (name.clone(), count + 1),
            None => (Rc::<str>::from(base), 0),
        };
        self.occurrences.insert(base.clone(), occurrence);
        let serial = self.next_serial;
        self.next_serial += 1;
        Dye {
            base,
            occurrence,
            serial,
        }
    }

    /// Same chain, new serial number
    pub fn derive_dye(&mut self, from: &Dye) -> Dye {
        let serial = self.next_serial;
        self.next_serial += 1;
        Dye {
            base: from.base.clone(),
            occurrence: from.occurrence,
            serial,
        }
    }

    fn log(&mut self, dye: &Dye, task: &str, tsn: u64, now: f64, event: &str) {
        if !self.output {
            return;
        }
        let line = format!(
            "W {} {} {} ! T {} {} ! {} ! E {}",
            dye.base,
            dye.occurrence,
            dye.serial,
            task,
            tsn,
            format_num(now),
            event
        );
        tracing::info!(target: "parasol::angio", "{line}");
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// `%g` rendering used in angio lines
pub(crate) fn format_num(value: f64) -> String {
    super::stats::format_g(value, 6, false)
}

/// Task names may not contain whitespace in angio output
fn cook_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

impl Kernel {
    pub(crate) fn angio_enabled(&self) -> bool {
        self.angio.is_some()
    }

    /// Log `event` for task `tid` against dye `dye`
    fn log_dye_event(&mut self, tid: TaskId, dye: &Dye, event: &str) {
        let now = self.now;
        let Some(task) = self.tasks.get(tid) else {
            return;
        };
        if task.role.is_internal() {
            return;
        }
        let (name, tsn) = (cook_name(&task.name), task.tsn);
        if let Some(angio) = self.angio.as_mut() {
            angio.log(dye, &name, tsn, now, event);
        }
    }

    /// Log `event` against the task's own dye
    pub(crate) fn log_angio_event_for(&mut self, tid: TaskId, event: &str) {
        if self.angio.is_none() {
            return;
        }
        let Some(dye) = self.tasks.get(tid).and_then(|task| task.dye.clone()) else {
            return;
        };
        self.log_dye_event(tid, &dye, event);
    }

    /// Log `event` for the hot task
    pub(crate) fn log_angio_event(&mut self, event: &str) {
        if let Some(tid) = self.hot {
            self.log_angio_event_for(tid, event);
        }
    }

    /// Dye for a new task: derived from its creator, or a fresh
    /// "Initial" chain when the driver creates it
    pub(crate) fn begin_task_dye(&mut self, tid: TaskId) {
        let parent_dye = self.hot.and_then(|p| self.tasks.get(p)).and_then(|p| p.dye.clone());
        let Some(angio) = self.angio.as_mut() else {
            return;
        };
        let dye = match parent_dye {
            Some(from) => angio.derive_dye(&from),
            None => angio.create_dye("Initial"),
        };
        self.task_mut(tid).dye = Some(dye);
        self.log_angio_event_for(tid, "wBegin");
    }

    /// Dye for a message sent by the hot task, logged as its wBegin
    pub(crate) fn message_dye(&mut self) -> Option<Dye> {
        let sender = self.hot?;
        let from = self.tasks.get(sender)?.dye.clone()?;
        let dye = self.angio.as_mut()?.derive_dye(&from);
        self.log_dye_event(sender, &dye, "wBegin");
        Some(dye)
    }

    /// Close the task's current chain
    pub(crate) fn end_trace(&mut self, tid: TaskId) {
        if self.angio.is_none() {
            return;
        }
        self.log_angio_event_for(tid, "wEnd");
        if let Some(task) = self.tasks.get_mut(tid) {
            task.dye = None;
        }
    }

    /// The receiver's chain ends and the message's chain continues in it
    pub(crate) fn adopt_message_dye(&mut self, tid: TaskId, dye: Option<Dye>) {
        if self.angio.is_none() {
            return;
        }
        self.end_trace(tid);
        self.task_mut(tid).dye = dye;
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Turn angio tracing on. Every existing task starts an "Initial"
    /// chain.
    pub(crate) fn enable_angio(&mut self) -> SyscallResult<()> {
        let user_tasks = self
            .tasks
            .iter()
            .filter(|(_, task)| !task.role.is_internal())
            .count();
        if self.angio.is_some() || user_tasks > 1 || self.now > 0.0 {
            return Err(self.bad_call("enable_angio_tracing", "Must be called before any other functions"));
        }
        self.angio = Some(Angio::new());
        for tid in self.tasks.keys() {
            self.begin_task_dye_fresh(tid);
        }
        Ok(())
    }

    fn begin_task_dye_fresh(&mut self, tid: TaskId) {
        let Some(angio) = self.angio.as_mut() else {
            return;
        };
        let dye = angio.create_dye("Initial");
        self.task_mut(tid).dye = Some(dye);
        self.log_angio_event_for(tid, "wBegin");
    }

    /// End the caller's chain and start a new one named `name`
    pub(crate) fn inject_trace_name(&mut self, name: &str) -> SyscallResult<()> {
        if self.angio.is_none() {
            return Err(self.bad_call("inject_trace_name", "Angio tracing not enabled"));
        }
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(self.bad_param("inject_trace_name", "name"));
        }
        let me = self.me();
        self.end_trace(me);
        if let Some(angio) = self.angio.as_mut() {
            let dye = angio.create_dye(name);
            self.task_mut(me).dye = Some(dye);
        }
        self.log_angio_event_for(me, "wBegin");
        Ok(())
    }

    pub(crate) fn toggle_angio_output(&mut self, on: bool) -> SyscallResult<()> {
        match self.angio.as_mut() {
            Some(angio) => {
                angio.output = on;
                Ok(())
            }
            None => Err(self.bad_call("toggle_angio_output", "Angio tracing not enabled")),
        }
    }

    pub(crate) fn log_user_event(&mut self, event: &str) -> SyscallResult<()> {
        if self.angio.is_none() {
            return Err(self.bad_call("log_user_event", "Angio tracing not enabled"));
        }
        self.log_angio_event(event);
        Ok(())
    }

    /// Marks the start of one cycle of a cyclic task
    pub(crate) fn task_cycle_begin(&mut self) -> SyscallResult<()> {
        if self.angio.is_none() {
            return Err(self.bad_call("task_cycle_begin", "Angio tracing not enabled"));
        }
        self.log_angio_event("wCycle");
        Ok(())
    }

    pub fn angio_lines(&self) -> &[String] {
        self.angio.as_ref().map_or(&[], |angio| angio.lines())
    }
}
