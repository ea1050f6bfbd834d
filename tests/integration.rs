//! Integration tests for the simulation kernel
//!
//! Whole runs: a Genesis body builds a small system, the driver runs it,
//! and the test checks what the tasks observed along the way.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use parasol::{
    Discipline, LockId, Message, SemId, SimConfig, Simulation, StatFlags, TaskCtx, TaskId,
    TaskState, Timeout,
};

type Log<T> = Rc<RefCell<Vec<T>>>;

fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

fn quiet() -> Simulation {
    Simulation::new(SimConfig {
        warning: false,
        ..SimConfig::default()
    })
}

/// Genesis keeps the calendar busy past the end of every run here
async fn idle_forever(ctx: &TaskCtx) {
    ctx.sleep(1.0e6).await.unwrap();
}

// ============================================================================
// Scheduling scenarios
// ============================================================================

#[test]
fn test_fifo_runs_in_arrival_order() {
    let mut sim = quiet();
    let cpu = sim
        .build_node("cpu", 1, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let done: Log<(&'static str, f64)> = log();
    let done_clone = done.clone();

    sim.run(100.0, move |ctx| async move {
        for (name, prio) in [("T1", 10), ("T2", 5)] {
            let done = done_clone.clone();
            let tid = ctx
                .create(name, cpu, None, prio, move |ctx| async move {
                    ctx.compute(5.0).await.unwrap();
                    done.borrow_mut().push((name, ctx.now()));
                })
                .unwrap();
            ctx.resume(tid).await.unwrap();
        }
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert_eq!(*done.borrow(), vec![("T1", 5.0), ("T2", 10.0)]);
}

#[test]
fn test_pr_preemption_resumes_remaining_work() {
    let mut sim = quiet();
    let cpu = sim
        .build_node("cpu", 1, 1.0, 0.0, Discipline::Pr, StatFlags::NONE)
        .unwrap();
    let done: Log<(&'static str, f64)> = log();
    let done_clone = done.clone();

    sim.run(100.0, move |ctx| async move {
        let worker = |name: &'static str, done: Log<(&'static str, f64)>| {
            move |ctx: TaskCtx| async move {
                ctx.compute(5.0).await.unwrap();
                done.borrow_mut().push((name, ctx.now()));
            }
        };
        let t2 = ctx.create("T2", cpu, None, 5, worker("T2", done_clone.clone())).unwrap();
        ctx.resume(t2).await.unwrap();
        ctx.sleep(1.0).await.unwrap();
        let t1 = ctx.create("T1", cpu, None, 10, worker("T1", done_clone.clone())).unwrap();
        ctx.resume(t1).await.unwrap();
        idle_forever(&ctx).await;
    })
    .unwrap();

    // T2 did one unit before being preempted and keeps its other four
    assert_eq!(*done.borrow(), vec![("T1", 6.0), ("T2", 10.0)]);
}

#[test]
fn test_cfs_shares_processor_between_equal_tasks() {
    let mut sim = quiet();
    let cpu = sim
        .build_node("cpu", 1, 1.0, 1.0, Discipline::Cfs, StatFlags::NONE)
        .unwrap();
    let counts = Rc::new([Cell::new(0u32), Cell::new(0u32)]);
    let counts_clone = counts.clone();

    sim.run(100.0, move |ctx| async move {
        for i in 0..2 {
            let counts = counts_clone.clone();
            let tid = ctx
                .create(&format!("w{i}"), cpu, None, 1, move |ctx| async move {
                    loop {
                        ctx.compute(0.5).await.unwrap();
                        counts[i].set(counts[i].get() + 1);
                    }
                })
                .unwrap();
            ctx.resume(tid).await.unwrap();
        }
        idle_forever(&ctx).await;
    })
    .unwrap();

    let (a, b) = (counts[0].get(), counts[1].get());
    assert!(a + b > 150, "processor mostly idle: {a} + {b}");
    assert!(a > 60 && b > 60, "unfair split: {a} vs {b}");
}

#[test]
fn test_migrate_moves_running_task() {
    let mut sim = quiet();
    let a = sim
        .build_node("a", 1, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let b = sim
        .build_node("b", 1, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let seen = Rc::new(Cell::new(None));
    let seen_clone = seen.clone();

    sim.run(100.0, move |ctx| async move {
        let tid = ctx
            .create("mover", a, None, 1, move |ctx| async move {
                ctx.compute(1.0).await.unwrap();
                let me = ctx.id();
                ctx.migrate(me, b, None).await.unwrap();
                ctx.compute(1.0).await.unwrap();
                seen_clone.set(Some((ctx.my_node(), ctx.now())));
            })
            .unwrap();
        ctx.resume(tid).await.unwrap();
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert_eq!(seen.get(), Some((b, 2.0)));
}

// ============================================================================
// Task lifecycle
// ============================================================================

#[test]
fn test_kill_removes_descendants_and_their_ports() {
    let mut sim = quiet();
    let cpu = sim
        .build_node("cpu", 1, 1.0, 0.0, Discipline::Pr, StatFlags::NONE)
        .unwrap();
    let child = Rc::new(Cell::new(None));
    let child_for_parent = child.clone();
    let child_for_genesis = child.clone();
    let after: Log<(TaskState, TaskState, bool, usize)> = log();
    let after_clone = after.clone();

    sim.run(100.0, move |ctx| async move {
        let parent = ctx
            .create("parent", cpu, None, 5, move |ctx| async move {
                let c = ctx
                    .create("child", cpu, None, 1, |ctx| async move {
                        loop {
                            ctx.sleep(1.0).await.unwrap();
                        }
                    })
                    .unwrap();
                child_for_parent.set(Some((c, ctx.std_port_of(c).unwrap())));
                ctx.resume(c).await.unwrap();
                ctx.sleep(1000.0).await.unwrap();
            })
            .unwrap();
        ctx.resume(parent).await.unwrap();
        ctx.sleep(5.0).await.unwrap();

        ctx.kill(parent).await.unwrap();
        let (c, port) = child_for_genesis.get().unwrap();
        after_clone.borrow_mut().push((
            ctx.task_state(parent),
            ctx.task_state(c),
            ctx.port_owner(port).is_none(),
            ctx.children().len(),
        ));
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert!(child.get().is_some());
    assert_eq!(
        *after.borrow(),
        vec![(TaskState::Free, TaskState::Free, true, 0)]
    );
}

#[test]
fn test_kill_genesis_is_refused() {
    let mut sim = quiet();
    let refused = Rc::new(Cell::new(false));
    let refused_clone = refused.clone();

    sim.run(10.0, move |ctx| async move {
        let me = ctx.id();
        refused_clone.set(ctx.kill(me).await.is_err());
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert!(refused.get());
}

#[test]
fn test_receive_timeout_returns_none() {
    let mut sim = quiet();
    let seen = Rc::new(Cell::new(None));
    let seen_clone = seen.clone();

    sim.run(10.0, move |ctx| async move {
        let port = ctx.std_port().unwrap();
        assert!(ctx.receive(port, Timeout::For(0.0)).await.is_err());
        let got = ctx.receive(port, Timeout::For(2.0)).await.unwrap();
        seen_clone.set(Some((got.is_none(), ctx.now())));
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert_eq!(seen.get(), Some((true, 2.0)));
}

#[test]
fn test_suspend_mid_compute_keeps_remaining_work() {
    let mut sim = quiet();
    let cpu = sim
        .build_node("cpu", 1, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let finished = Rc::new(Cell::new(None));
    let parked = Rc::new(Cell::new(None));
    let (finished_c, parked_c) = (finished.clone(), parked.clone());

    sim.run(100.0, move |ctx| async move {
        let worker = ctx
            .create("worker", cpu, None, 1, move |ctx| async move {
                ctx.compute(4.0).await.unwrap();
                finished_c.set(Some(ctx.now()));
            })
            .unwrap();
        ctx.resume(worker).await.unwrap();
        ctx.sleep(1.0).await.unwrap();
        ctx.suspend(worker).await.unwrap();
        parked_c.set(Some(ctx.task_state(worker)));
        ctx.sleep(2.0).await.unwrap();
        ctx.resume(worker).await.unwrap();
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert_eq!(parked.get(), Some(TaskState::Suspended));
    // One unit done before the suspension, three after the resume at 3
    assert_eq!(finished.get(), Some(6.0));
}

// ============================================================================
// Messaging
// ============================================================================

#[test]
fn test_port_fifo_and_lifo_order() {
    let mut sim = quiet();
    let order: Log<i64> = log();
    let order_clone = order.clone();

    sim.run(10.0, move |ctx| async move {
        let fifo = ctx.std_port().unwrap();
        let lifo = ctx.allocate_port("lifo").unwrap();
        for port in [fifo, lifo] {
            ctx.send(port, Message::new(1)).await.unwrap();
            ctx.send(port, Message::new(2)).await.unwrap();
        }
        for _ in 0..2 {
            let msg = ctx.receive(fifo, Timeout::Immediate).await.unwrap().unwrap();
            order_clone.borrow_mut().push(msg.mtype);
        }
        for _ in 0..2 {
            let msg = ctx.receive_last(lifo, Timeout::Immediate).await.unwrap().unwrap();
            order_clone.borrow_mut().push(msg.mtype);
        }
        assert!(ctx.receive(fifo, Timeout::Immediate).await.unwrap().is_none());
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert_eq!(*order.borrow(), vec![1, 2, 2, 1]);
}

#[test]
fn test_receive_priority_and_random() {
    let mut sim = quiet();
    let order: Log<i64> = log();
    let order_clone = order.clone();

    sim.run(10.0, move |ctx| async move {
        let port = ctx.std_port().unwrap();
        for (mtype, prio) in [(1, 0), (2, 7), (3, 3)] {
            ctx.send_priority(port, prio, Message::new(mtype)).await.unwrap();
        }
        let first = ctx.receive_priority(port, Timeout::Immediate).await.unwrap().unwrap();
        order_clone.borrow_mut().push(first.mtype);

        for mtype in 10..15 {
            ctx.send(port, Message::new(mtype)).await.unwrap();
        }
        let mut rest = Vec::new();
        while let Some(msg) = ctx.receive_random(port, Timeout::Immediate).await.unwrap() {
            rest.push(msg.mtype);
        }
        rest.sort();
        order_clone.borrow_mut().extend(rest);
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert_eq!(*order.borrow(), vec![2, 1, 3, 10, 11, 12, 13, 14]);
}

#[test]
fn test_receive_priority_with_only_negative_priorities() {
    let mut sim = quiet();
    let picked = Rc::new(Cell::new(None));
    let picked_c = picked.clone();

    sim.run(10.0, move |ctx| async move {
        let port = ctx.std_port().unwrap();
        for (mtype, prio) in [(1, -5), (2, -1), (3, -3), (4, -1)] {
            ctx.send_priority(port, prio, Message::new(mtype)).await.unwrap();
        }
        let msg = ctx.receive_priority(port, Timeout::Immediate).await.unwrap().unwrap();
        picked_c.set(Some(msg.mtype));
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert_eq!(picked.get(), Some(2));
}

#[test]
fn test_bus_transmits_one_message_at_a_time() {
    let mut sim = quiet();
    let a = sim
        .build_node("a", 1, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let b = sim
        .build_node("b", 1, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let bus = sim
        .build_bus("bus", &[a, b], 1.0, Discipline::Fifo, StatFlags::PER_NODE)
        .unwrap();
    let arrivals: Log<(f64, f64)> = log();
    let arrivals_clone = arrivals.clone();

    sim.run(100.0, move |ctx| async move {
        let receiver = ctx
            .create("receiver", b, None, 1, move |ctx| async move {
                let port = ctx.std_port().unwrap();
                for _ in 0..3 {
                    let msg = ctx.receive(port, Timeout::Forever).await.unwrap().unwrap();
                    arrivals_clone.borrow_mut().push((ctx.now(), msg.ts));
                }
                idle_forever(&ctx).await;
            })
            .unwrap();
        ctx.resume(receiver).await.unwrap();
        let port = ctx.std_port_of(receiver).unwrap();

        let sender = ctx
            .create("sender", a, None, 1, move |ctx| async move {
                for i in 0..3 {
                    ctx.bus_send(bus, port, Message::new(i).with_size(1)).unwrap();
                }
            })
            .unwrap();
        ctx.resume(sender).await.unwrap();
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert_eq!(
        *arrivals.borrow(),
        vec![(1.0, 0.0), (2.0, 0.0), (3.0, 0.0)]
    );
    let util = sim.stats();
    let bus_util = util.get("bus Utilization").unwrap();
    assert!((bus_util.mean - 0.03).abs() < 1e-9);
}

#[test]
fn test_port_set_gathers_member_ports() {
    let mut sim = quiet();
    let got: Log<(i64, bool)> = log();
    let got_clone = got.clone();

    sim.run(10.0, move |ctx| async move {
        let set = ctx.allocate_port_set("set").unwrap();
        let p1 = ctx.allocate_port("p1").unwrap();
        let p2 = ctx.allocate_port("p2").unwrap();
        ctx.join_port_set(set, p1).await.unwrap();
        ctx.join_port_set(set, p2).await.unwrap();

        ctx.send(p2, Message::new(2)).await.unwrap();
        ctx.send(p1, Message::new(1)).await.unwrap();
        for expected in [p2, p1] {
            let msg = ctx.receive(set, Timeout::Immediate).await.unwrap().unwrap();
            got_clone.borrow_mut().push((msg.mtype, msg.origin == Some(expected)));
        }

        ctx.leave_port_set(set, p1).await.unwrap();
        ctx.send(p1, Message::new(3)).await.unwrap();
        let direct = ctx.receive(p1, Timeout::Immediate).await.unwrap().unwrap();
        got_clone.borrow_mut().push((direct.mtype, true));
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert_eq!(*got.borrow(), vec![(2, true), (1, true), (3, true)]);
}

#[test]
fn test_shared_port_hands_each_message_to_one_receiver() {
    let mut sim = quiet();
    let cpu = sim
        .build_node("cpu", 2, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let got: Log<(&'static str, i64)> = log();
    let got_clone = got.clone();

    sim.run(10.0, move |ctx| async move {
        let shared = ctx.allocate_shared_port().await.unwrap();
        for name in ["R1", "R2"] {
            let got = got_clone.clone();
            let tid = ctx
                .create(name, cpu, None, 1, move |ctx| async move {
                    loop {
                        let msg = ctx
                            .receive_shared(shared, Timeout::Forever)
                            .await
                            .unwrap()
                            .unwrap();
                        got.borrow_mut().push((name, msg.mtype));
                    }
                })
                .unwrap();
            ctx.resume(tid).await.unwrap();
        }
        ctx.sleep(1.0).await.unwrap();
        for mtype in 1..=4 {
            ctx.send(shared, Message::new(mtype)).await.unwrap();
        }
        idle_forever(&ctx).await;
    })
    .unwrap();

    let mut by_receiver = got.borrow().clone();
    by_receiver.sort();
    assert_eq!(
        by_receiver,
        vec![("R1", 1), ("R1", 3), ("R2", 2), ("R2", 4)]
    );
}

// ============================================================================
// Synchronization
// ============================================================================

#[test]
fn test_lock_excludes_other_holders() {
    let mut sim = quiet();
    let cpu = sim
        .build_node("cpu", 3, 1.0, 0.0, Discipline::Pr, StatFlags::NONE)
        .unwrap();
    let holder = Rc::new(Cell::new(None::<TaskId>));
    let overlap = Rc::new(Cell::new(false));
    let entries: Log<f64> = log();
    let (holder_c, overlap_c, entries_c) = (holder.clone(), overlap.clone(), entries.clone());

    sim.run(100.0, move |ctx| async move {
        for i in 0..3 {
            let (holder, overlap, entries) = (holder_c.clone(), overlap_c.clone(), entries_c.clone());
            let tid = ctx
                .create(&format!("w{i}"), cpu, None, 1, move |ctx| async move {
                    let lock = LockId(0);
                    ctx.lock(lock).await;
                    if holder.get().is_some() {
                        overlap.set(true);
                    }
                    holder.set(Some(ctx.id()));
                    entries.borrow_mut().push(ctx.now());
                    ctx.hold(1.0).await.unwrap();
                    holder.set(None);
                    ctx.unlock(lock).await.unwrap();
                })
                .unwrap();
            ctx.resume(tid).await.unwrap();
        }
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert!(!overlap.get());
    assert_eq!(*entries.borrow(), vec![0.0, 1.0, 2.0]);
    assert_eq!(sim.kernel().lock_owner(LockId(0)), None);
    assert_eq!(sim.kernel().lock_waiters(LockId(0)), 0);
}

#[test]
fn test_semaphore_count_restored_after_wait_signal_pairs() {
    let mut sim = quiet();
    let cpu = sim
        .build_node("cpu", 3, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let entries: Log<f64> = log();
    let entries_c = entries.clone();

    sim.run(100.0, move |ctx| async move {
        for i in 0..3 {
            let entries = entries_c.clone();
            let tid = ctx
                .create(&format!("w{i}"), cpu, None, 1, move |ctx| async move {
                    let sem = SemId(2);
                    ctx.wait(sem).await.unwrap();
                    entries.borrow_mut().push(ctx.now());
                    ctx.hold(1.0).await.unwrap();
                    ctx.signal(sem).await.unwrap();
                })
                .unwrap();
            ctx.resume(tid).await.unwrap();
        }
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert_eq!(*entries.borrow(), vec![0.0, 1.0, 2.0]);
    assert_eq!(sim.kernel().semaphore_count(SemId(2)), 1);
    assert!(sim.kernel().semaphore_waiters(SemId(2)).is_empty());
}

#[test]
fn test_killed_semaphore_waiter_gives_back_its_count() {
    let mut sim = quiet();
    let cpu = sim
        .build_node("cpu", 3, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let sem = SemId(4);
    let after_kill = Rc::new(Cell::new(None));
    let late_entry = Rc::new(Cell::new(None));
    let (after_kill_c, late_entry_c) = (after_kill.clone(), late_entry.clone());

    sim.run(100.0, move |ctx| async move {
        let holder = ctx
            .create("holder", cpu, None, 1, move |ctx| async move {
                ctx.wait(sem).await.unwrap();
                ctx.hold(3.0).await.unwrap();
                ctx.signal(sem).await.unwrap();
            })
            .unwrap();
        ctx.resume(holder).await.unwrap();
        let waiter = ctx
            .create("waiter", cpu, None, 1, move |ctx| async move {
                ctx.wait(sem).await.unwrap();
            })
            .unwrap();
        ctx.resume(waiter).await.unwrap();

        ctx.sleep(1.0).await.unwrap();
        ctx.kill(waiter).await.unwrap();
        after_kill_c.set(Some(ctx.with(|k| k.semaphore_count(sem))));

        ctx.sleep(3.0).await.unwrap();
        let late = ctx
            .create("late", cpu, None, 1, move |ctx| async move {
                ctx.wait(sem).await.unwrap();
                late_entry_c.set(Some(ctx.now()));
                ctx.signal(sem).await.unwrap();
            })
            .unwrap();
        ctx.resume(late).await.unwrap();
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert_eq!(after_kill.get(), Some(0));
    assert_eq!(late_entry.get(), Some(4.0));
    assert_eq!(sim.kernel().semaphore_count(sem), 1);
    assert!(sim.kernel().semaphore_waiters(sem).is_empty());
}

#[test]
fn test_signal_skips_waiter_resumed_elsewhere() {
    let mut sim = quiet();
    let cpu = sim
        .build_node("cpu", 2, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let sem = SemId(3);
    let released = Rc::new(Cell::new(None));
    let signalled = Rc::new(Cell::new(false));
    let (released_c, signalled_c) = (released.clone(), signalled.clone());

    sim.run(100.0, move |ctx| async move {
        ctx.reset_semaphore(sem, 0).await.unwrap();
        let waiter = ctx
            .create("waiter", cpu, None, 1, move |ctx| async move {
                ctx.wait(sem).await.unwrap();
                released_c.set(Some(ctx.now()));
                idle_forever(&ctx).await;
            })
            .unwrap();
        ctx.resume(waiter).await.unwrap();
        ctx.sleep(1.0).await.unwrap();
        ctx.resume(waiter).await.unwrap();
        signalled_c.set(ctx.signal(sem).await.is_ok());
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert!(signalled.get());
    assert_eq!(released.get(), Some(1.0));
    assert_eq!(sim.kernel().semaphore_count(sem), 0);
    assert!(sim.kernel().semaphore_waiters(sem).is_empty());
}

#[test]
fn test_killed_spinner_leaves_lock_to_next_waiter() {
    let mut sim = quiet();
    let cpu = sim
        .build_node("cpu", 3, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let lock = LockId(1);
    let entries: Log<(&'static str, f64)> = log();
    let entries_c = entries.clone();

    sim.run(100.0, move |ctx| async move {
        let mut spinners = Vec::new();
        for name in ["holder", "s1", "s2"] {
            let entries = entries_c.clone();
            let tid = ctx
                .create(name, cpu, None, 1, move |ctx| async move {
                    ctx.lock(lock).await;
                    entries.borrow_mut().push((name, ctx.now()));
                    ctx.hold(2.0).await.unwrap();
                    ctx.unlock(lock).await.unwrap();
                })
                .unwrap();
            ctx.resume(tid).await.unwrap();
            spinners.push(tid);
        }
        ctx.sleep(1.0).await.unwrap();
        ctx.kill(spinners[1]).await.unwrap();
        idle_forever(&ctx).await;
    })
    .unwrap();

    assert_eq!(*entries.borrow(), vec![("holder", 0.0), ("s2", 2.0)]);
    assert_eq!(sim.kernel().lock_owner(lock), None);
    assert_eq!(sim.kernel().lock_waiters(lock), 0);
}

// ============================================================================
// Statistics and tracing
// ============================================================================

#[test]
fn test_busy_processor_utilization_is_one() {
    let mut sim = quiet();
    let cpu = sim
        .build_node("cpu", 1, 1.0, 0.0, Discipline::Fifo, StatFlags::PER_NODE | StatFlags::PER_HOST)
        .unwrap();

    let report = sim
        .run(50.0, move |ctx| async move {
            let tid = ctx
                .create("worker", cpu, None, 1, |ctx| async move {
                    loop {
                        ctx.compute(1.0).await.unwrap();
                    }
                })
                .unwrap();
            ctx.resume(tid).await.unwrap();
        })
        .unwrap();

    for name in ["cpu Utilization", "cpu (cpu 0) Utilization"] {
        let entry = report.get(name).unwrap();
        assert!((entry.mean - 1.0).abs() < 1e-9, "{name}: {}", entry.mean);
    }
    assert!(sim.stats_text().contains("cpu Utilization"));
}

#[test]
fn test_user_statistics() {
    let mut sim = quiet();
    let values = Rc::new(Cell::new((0.0, 0.0, 0.0)));
    let values_clone = values.clone();

    sim.run(10.0, move |ctx| async move {
        let sample = ctx.open_stat("resp", parasol::StatKind::Sample).unwrap();
        let level = ctx.open_stat("level", parasol::StatKind::Variable).unwrap();
        for v in [1.0, 2.0, 6.0] {
            ctx.record_stat(sample, v).unwrap();
        }
        ctx.record_stat(level, 2.0).unwrap();
        ctx.sleep(4.0).await.unwrap();
        ctx.record_stat(level, 0.0).unwrap();
        let (mean, obs) = ctx.get_stat(sample).unwrap();
        let (level_mean, _) = ctx.get_stat(level).unwrap();
        values_clone.set((mean, obs, level_mean));
        assert!(ctx.record_rate_stat(sample).is_err());
        idle_forever(&ctx).await;
    })
    .unwrap();

    let (mean, obs, level_mean) = values.get();
    assert_eq!((mean, obs), (3.0, 3.0));
    assert!((level_mean - 2.0).abs() < 1e-9);
}

#[test]
fn test_block_stats_report_batches() {
    let mut sim = quiet();
    let cpu = sim
        .build_node("cpu", 1, 1.0, 0.0, Discipline::Fifo, StatFlags::PER_NODE)
        .unwrap();

    sim.run(50.0, move |ctx| async move {
        ctx.block_stats(4, 10.0).unwrap();
        assert!(ctx.block_stats(4, 10.0).is_err());
        let tid = ctx
            .create("worker", cpu, None, 1, |ctx| async move {
                loop {
                    ctx.compute(1.0).await.unwrap();
                }
            })
            .unwrap();
        ctx.resume(tid).await.unwrap();
    })
    .unwrap();

    let report = sim.block_report().unwrap();
    assert!(report.contains("Blocked simulation statistics for time = 50."));
    assert!(report.contains("cpu Utilization"));
}

#[test]
fn test_trace_reports_task_transitions() {
    let mut sim = Simulation::new(SimConfig::default().with_trace(true));
    let cpu = sim
        .build_node("cpu", 1, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();

    sim.run(10.0, move |ctx| async move {
        let tid = ctx
            .create("worker", cpu, None, 1, |ctx| async move {
                ctx.compute(1.0).await.unwrap();
            })
            .unwrap();
        ctx.resume(tid).await.unwrap();
        idle_forever(&ctx).await;
    })
    .unwrap();

    let events = sim.trace_events();
    let worker: Vec<&str> = events
        .iter()
        .filter(|e| e.name == "worker")
        .map(|e| e.message.as_str())
        .collect();
    assert_eq!(worker.first(), Some(&"created (suspended)"));
    assert!(worker.contains(&"executing"));
    assert_eq!(worker.last(), Some(&"dead"));
}

#[test]
fn test_send_trace_names_the_medium() {
    let mut sim = Simulation::new(SimConfig::default().with_trace(true));
    let a = sim
        .build_node("a", 1, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let b = sim
        .build_node("b", 1, 1.0, 0.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let bus = sim
        .build_bus("wire", &[a, b], 1.0, Discipline::Fifo, StatFlags::NONE)
        .unwrap();
    let link = sim.build_link("cable", a, b, 1.0, StatFlags::NONE).unwrap();

    sim.run(10.0, move |ctx| async move {
        let receiver = ctx
            .create("receiver", b, None, 1, |ctx| async move {
                idle_forever(&ctx).await;
            })
            .unwrap();
        ctx.resume(receiver).await.unwrap();
        let port = ctx.std_port_of(receiver).unwrap();
        let sender = ctx
            .create("sender", a, None, 1, move |ctx| async move {
                ctx.bus_send(bus, port, Message::new(1).with_size(1)).unwrap();
                ctx.link_send(link, port, Message::new(2).with_size(1)).unwrap();
            })
            .unwrap();
        ctx.resume(sender).await.unwrap();
        idle_forever(&ctx).await;
    })
    .unwrap();

    let events = sim.trace_events();
    let sends: Vec<&str> = events
        .iter()
        .filter(|e| e.name == "sender" && e.message.starts_with("sending message"))
        .map(|e| e.message.as_str())
        .collect();
    assert_eq!(sends.len(), 2);
    assert!(sends[0].ends_with("bus 0 (wire)"), "{}", sends[0]);
    assert!(sends[1].ends_with("link 0 (cable)"), "{}", sends[1]);
}

#[test]
fn test_angio_lines_follow_schema() {
    let mut sim = quiet();
    sim.enable_angio_tracing().unwrap();

    sim.run(10.0, |ctx| async move {
        ctx.compute(2.0).await.unwrap();
        ctx.inject_trace_name("request").unwrap();
        ctx.log_user_event("checkpoint").unwrap();
        idle_forever(&ctx).await;
    })
    .unwrap();

    let lines = sim.angio_lines();
    assert_eq!(lines[0], "W Initial 0 0 ! T Genesis 0 ! 0 ! E wBegin");
    assert!(lines.contains(&"W Initial 0 0 ! T Genesis 0 ! 0 ! E wUse 2".to_string()));
    assert!(lines.contains(&"W Initial 0 0 ! T Genesis 0 ! 2 ! E wEnd".to_string()));
    assert!(lines.iter().any(|l| l.starts_with("W request 0 ") && l.ends_with("! 2 ! E checkpoint")));
}

#[test]
fn test_same_seed_same_run() {
    fn run(seed: u64) -> Vec<i64> {
        let mut sim = Simulation::new(SimConfig::default().with_seed(seed));
        let order: Log<i64> = log();
        let order_clone = order.clone();
        sim.run(10.0, move |ctx| async move {
            let port = ctx.std_port().unwrap();
            for mtype in 0..8 {
                ctx.send(port, Message::new(mtype)).await.unwrap();
            }
            while let Some(msg) = ctx.receive_random(port, Timeout::Immediate).await.unwrap() {
                order_clone.borrow_mut().push(msg.mtype);
            }
            idle_forever(&ctx).await;
        })
        .unwrap();
        order.take()
    }

    assert_eq!(run(7), run(7));
}
