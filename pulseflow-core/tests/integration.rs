//! Integration Tests for Propagation Rounds
//!
//! These tests drive whole graphs through the public API: changesets,
//! pulses, ranks and the scheduler working together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pulseflow_core::data::{tupleid, Changeset, Value};
use pulseflow_core::dataflow::{Dataflow, RunStatus};
use pulseflow_core::error::{ConfigError, DataflowError, EvalError, EvalFailure};
use pulseflow_core::operator::builtin::Filter;
use pulseflow_core::operator::{func, Output, Params};
use pulseflow_core::pulse::Flags;
use serde_json::json;

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    (count.clone(), count)
}

/// Ingest three records, count them, then remove one and modify another.
/// Only the operator watching the modified field reacts in the second round.
#[test]
fn changeset_rounds_reach_only_affected_operators() {
    let mut df = Dataflow::new();
    let data = df.add_kind("collect", Params::new()).unwrap();
    let arrivals = df
        .add(
            func::transform("arrivals", |_, pulse| {
                Ok(Output::pulse(pulse.fork(Flags::ADD | Flags::NO_FIELDS)))
            }),
            Params::new().pulse(data),
        )
        .unwrap();
    let count = df
        .add_kind("count", Params::new().pulse(arrivals))
        .unwrap();
    let watch = df
        .add_kind(
            "field_watch",
            Params::new().literal("field", "price").pulse(data),
        )
        .unwrap();

    let (insert, tuples) = Changeset::new().insert_tracked([
        json!({"price": 1}),
        json!({"price": 2}),
        json!({"price": 3}),
    ]);
    df.pulse(data, insert).unwrap();
    df.run().unwrap();

    let ids: Vec<_> = tuples.iter().map(|t| tupleid(t).unwrap()).collect();
    assert!(ids[0] != ids[1] && ids[1] != ids[2] && ids[0] != ids[2]);
    assert_eq!(df.value(count), Some(&Value::Number(3.0)));
    assert!(!df.modified(watch));

    let count_runs = df.evaluations(count);
    let watch_runs = df.evaluations(watch).unwrap();

    let change = Changeset::new()
        .remove([tuples[0].clone()])
        .modify([tuples[1].clone()], "price", 20);
    df.pulse(data, change).unwrap();
    df.run().unwrap();

    assert_eq!(df.evaluations(count), count_runs);
    assert_eq!(df.value(count), Some(&Value::Number(3.0)));
    assert!(!df.modified(count));

    assert!(df.modified(watch));
    assert_eq!(df.evaluations(watch), Some(watch_runs + 1));
    assert_eq!(df.value(watch), Some(&Value::Number(1.0)));
    assert_eq!(tuples[1].number("price"), Some(20.0));
    assert_eq!(
        df.value(data).and_then(Value::as_tuples).map(<[_]>::len),
        Some(2)
    );
}

/// Test that every edge keeps rank order after late connections.
#[test]
fn ranks_stay_ordered_after_connect() {
    let mut df = Dataflow::new();
    let a = df.add_value(1.0);
    let b = df
        .add(
            func::value("b", |p| Ok(Value::from(p.number("a")? + 1.0))),
            Params::new().reference("a", a),
        )
        .unwrap();
    let c = df.add_value(0.0);
    let d = df
        .add(
            func::value("d", |p| Ok(p.value("c")?.clone())),
            Params::new().reference("c", c),
        )
        .unwrap();

    df.connect(b, c).unwrap();
    assert!(df.check_ranks());
    assert!(df.rank(c) > df.rank(b));
    assert!(df.rank(d) > df.rank(c));

    let err = df.connect(d, a).unwrap_err();
    assert!(matches!(err, ConfigError::Cycle { .. }));
    assert!(df.check_ranks());
}

/// Test that re-running without changes evaluates nothing.
#[test]
fn rerun_without_changes_is_idle() {
    let mut df = Dataflow::new();
    let x = df.add_value(2.0);
    let (runs, seen) = counter();
    df.add(
        func::value("square", move |p| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from(p.number("x")?.powi(2)))
        }),
        Params::new().reference("x", x),
    )
    .unwrap();

    let first = df.run().unwrap();
    assert!(matches!(first, RunStatus::Completed(report) if report.evaluated == 2));
    let clock = df.clock();

    let second = df.run().unwrap();
    assert!(matches!(second, RunStatus::Completed(report) if report.evaluated == 0));
    assert_eq!(df.clock(), clock);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// Test that an operator with two changed inputs runs once per round.
#[test]
fn diamond_evaluates_join_once() {
    let mut df = Dataflow::new();
    let x = df.add_value(1.0);
    let left = df
        .add(
            func::value("left", |p| Ok(Value::from(p.number("x")? + 1.0))),
            Params::new().reference("x", x),
        )
        .unwrap();
    let right = df
        .add(
            func::value("right", |p| Ok(Value::from(p.number("x")? * 10.0))),
            Params::new().reference("x", x),
        )
        .unwrap();
    let (runs, seen) = counter();
    let join = df
        .add(
            func::value("join", move |p| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(Value::from(p.number("l")? + p.number("r")?))
            }),
            Params::new().reference("l", left).reference("r", right),
        )
        .unwrap();

    df.run().unwrap();
    df.update(x, 2.0).unwrap();
    df.run().unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(df.value(join), Some(&Value::Number(23.0)));
}

/// Test that an unchanged value stops propagation.
#[test]
fn unchanged_value_does_not_schedule_dependents() {
    let mut df = Dataflow::new();
    let x = df.add_value(3.0);
    let sign = df
        .add(
            func::value("sign", |p| Ok(Value::from(p.number("x")?.signum()))),
            Params::new().reference("x", x),
        )
        .unwrap();
    let (runs, seen) = counter();
    df.add(
        func::value("label", move |p| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from(if p.number("s")? > 0.0 { "up" } else { "down" }))
        }),
        Params::new().reference("s", sign),
    )
    .unwrap();

    df.run().unwrap();
    df.update(x, 7.0).unwrap();
    df.run().unwrap();

    assert!(!df.modified(sign));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// Test that a failing operator is contained: its value is kept, its
/// dependents are skipped and unrelated operators still update.
#[test]
fn failure_is_contained_to_its_subgraph() {
    let mut df = Dataflow::new();
    let x = df.add_value(1.0);
    let fragile = df
        .add(
            func::value("fragile", |p| {
                let x = p.number("x")?;
                if x > 1.0 {
                    Err(EvalError::failed("too large"))
                } else {
                    Ok(Value::from(x))
                }
            }),
            Params::new().reference("x", x),
        )
        .unwrap();
    let (below_runs, seen) = counter();
    let below = df
        .add(
            func::value("below", move |p| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(p.value("f")?.clone())
            }),
            Params::new().reference("f", fragile),
        )
        .unwrap();
    let other = df
        .add(
            func::value("other", |p| Ok(Value::from(p.number("x")? * 3.0))),
            Params::new().reference("x", x),
        )
        .unwrap();

    let reported: Arc<Mutex<Vec<EvalFailure>>> = Arc::default();
    let sink = reported.clone();
    df.on_error(move |failure| sink.lock().unwrap().push(failure.clone()));

    df.run().unwrap();
    df.update(x, 5.0).unwrap();
    let err = df.run().unwrap_err();

    let DataflowError::RoundFailed { stamp, failures } = err else {
        panic!("expected a failed round");
    };
    assert_eq!(stamp, 2);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].op, fragile);
    assert_eq!(failures[0].kind, "fragile");
    assert_eq!(reported.lock().unwrap().as_slice(), failures.as_slice());

    assert_eq!(df.value(fragile), Some(&Value::Number(1.0)));
    assert_eq!(df.value(below), Some(&Value::Number(1.0)));
    assert_eq!(below_runs.load(Ordering::SeqCst), 1);
    assert_eq!(df.value(other), Some(&Value::Number(15.0)));
    assert_eq!(df.clock(), 2);
}

/// Test that a removed operator's dependents see `Null`.
#[test]
fn removed_reference_resolves_to_null() {
    let mut df = Dataflow::new();
    let x = df.add_value(4.0);
    let echo = df
        .add(
            func::value("echo", |p| Ok(p.value("x")?.clone())),
            Params::new().reference("x", x),
        )
        .unwrap();
    df.run().unwrap();

    df.remove(x).unwrap();
    assert!(df.value(x).is_none());
    df.touch(echo).unwrap();
    df.run().unwrap();
    assert_eq!(df.value(echo), Some(&Value::Null));
}

/// Test that a filter turns modifications into adds and removals downstream.
#[test]
fn filter_feeds_collect() {
    let mut df = Dataflow::new();
    let data = df.add_kind("collect", Params::new()).unwrap();
    let expensive = df
        .add(
            Filter::new(|t| t.number("price").is_some_and(|p| p >= 10.0)),
            Params::new().pulse(data),
        )
        .unwrap();
    let selected = df
        .add_kind("collect", Params::new().pulse(expensive))
        .unwrap();

    let (insert, tuples) = Changeset::new()
        .insert_tracked([json!({"price": 5}), json!({"price": 50})]);
    df.pulse(data, insert).unwrap();
    df.run().unwrap();
    assert_eq!(
        df.value(selected).and_then(Value::as_tuples).map(<[_]>::len),
        Some(1)
    );

    df.pulse(
        data,
        Changeset::new()
            .modify([tuples[0].clone()], "price", 12)
            .modify([tuples[1].clone()], "price", 1),
    )
    .unwrap();
    df.run().unwrap();

    let selected = df.value(selected).and_then(Value::as_tuples).unwrap();
    assert_eq!(selected.len(), 1);
    assert!(selected[0].same(&tuples[0]));
}

/// Test that a tuple inserted and removed in one changeset stays invisible
/// downstream, even when the same changeset also modifies it.
#[test]
fn cancelled_insert_never_reaches_consumers() {
    let mut df = Dataflow::new();
    let data = df.add_kind("collect", Params::new()).unwrap();
    let large = df
        .add(
            Filter::new(|t| t.number("v").is_some_and(|v| v > 10.0)),
            Params::new().pulse(data),
        )
        .unwrap();
    let selected = df.add_kind("collect", Params::new().pulse(large)).unwrap();

    let (insert, fresh) = Changeset::new().insert_tracked([json!({"v": 1})]);
    let change = insert
        .remove(fresh.clone())
        .modify(fresh.clone(), "v", 50);
    df.pulse(data, change).unwrap();
    df.run().unwrap();

    let held = |op| df.value(op).and_then(Value::as_tuples).map_or(0, <[_]>::len);
    assert_eq!(held(data), 0);
    assert_eq!(held(selected), 0);
    assert_eq!(fresh[0].number("v"), Some(1.0));
}

/// Test that changesets queued before a run are merged into one pulse.
#[test]
fn queued_changesets_merge() {
    let mut df = Dataflow::new();
    let data = df.add_kind("collect", Params::new()).unwrap();
    let count = df.add_kind("count", Params::new().pulse(data)).unwrap();

    df.pulse(data, Changeset::new().insert([json!({"a": 1})])).unwrap();
    df.pulse(data, Changeset::new().insert([json!({"a": 2})])).unwrap();
    let status = df.run().unwrap();

    assert!(matches!(status, RunStatus::Completed(report) if report.evaluated == 2));
    assert_eq!(df.value(count), Some(&Value::Number(2.0)));
}

/// Test that a predicate removal drops every matching tuple.
#[test]
fn remove_where_matches_current_tuples() {
    let mut df = Dataflow::new();
    let data = df.add_kind("collect", Params::new()).unwrap();
    let count = df.add_kind("count", Params::new().pulse(data)).unwrap();

    df.pulse(
        data,
        Changeset::new().insert((0..6).map(|i| json!({ "i": i }))),
    )
    .unwrap();
    df.run().unwrap();

    df.pulse(
        data,
        Changeset::new().remove_where(|t| t.number("i").is_some_and(|i| i >= 4.0)),
    )
    .unwrap();
    df.run().unwrap();
    assert_eq!(df.value(count), Some(&Value::Number(4.0)));
}
