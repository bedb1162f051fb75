//! Integration tests for multi-process pipelines.
//!
//! Every stage here is a real `forkline-worker` process.

use forkline::execution::{Initializer, WorkerCommand};
use forkline::pipeline::{Lifecycle, Pipeline, PipelineConfig, StageEvent};
use forkline::value::Value;
use forkline::Error;
use std::time::Duration;
use tokio::time::timeout;

const DEADLINE: Duration = Duration::from_secs(20);

fn pipeline() -> Pipeline {
    let config = PipelineConfig::default()
        .with_name("integration")
        .with_worker(WorkerCommand::new(env!("CARGO_BIN_EXE_forkline-worker")))
        .with_initializer(Initializer::named("arith"))
        .with_call_timeout(Duration::from_secs(10));
    Pipeline::new(config).unwrap()
}

fn ints(values: impl IntoIterator<Item = i64>) -> Vec<Value> {
    values.into_iter().map(Value::from).collect()
}

/// Results come back in push order.
#[tokio::test]
async fn test_map_preserves_order() {
    let pipeline = pipeline();
    let stage = pipeline.map("inc").await.unwrap();
    let results = stage.results().unwrap();

    stage.push(1..=200i64);
    stage.close();

    let values = timeout(DEADLINE, results.collect_all()).await.unwrap();
    assert_eq!(values, ints(2..=201));
    assert_eq!(stage.closed().await.unwrap(), None);
    assert_eq!(stage.lifecycle(), Lifecycle::Closed);
}

/// filterMap drops items mapped to null.
#[tokio::test]
async fn test_keep_even_double() {
    let pipeline = pipeline();
    let stage = pipeline.filter_map("double_if_even").await.unwrap();
    let results = stage.results().unwrap();

    stage.push([1, 2, 3, 4]);
    stage.close();

    let values = timeout(DEADLINE, results.collect_all()).await.unwrap();
    assert_eq!(values, ints([4, 8]));
}

/// Each applied operation runs in its own process.
#[tokio::test]
async fn test_chain_spawns_new_worker() {
    let pipeline = pipeline();
    let head = pipeline.filter_map("double_if_even").await.unwrap();
    let tail = head.map("inc").await.unwrap();

    assert_ne!(head, tail);
    assert_ne!(head.id(), tail.id());
    assert!(head.pid().is_some());
    assert_ne!(head.pid(), tail.pid());
    assert_eq!(pipeline.stages(), 2);

    let results = tail.results().unwrap();
    head.push([1, 2, 3, 4]);
    head.close();

    let values = timeout(DEADLINE, results.collect_all()).await.unwrap();
    assert_eq!(values, ints([5, 9]));

    // Closing the head closes the tail once it has drained.
    timeout(DEADLINE, tail.closed()).await.unwrap().unwrap();
    assert_eq!(tail.lifecycle(), Lifecycle::Closed);
}

/// Results produced before a successor is attached are forwarded at link time.
#[tokio::test]
async fn test_buffered_results_flushed_on_link() {
    let pipeline = pipeline();
    let head = pipeline.map("inc").await.unwrap();
    head.push([1, 2, 3]);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let tail = head.map("double").await.unwrap();
    let results = tail.results().unwrap();
    head.push([4]);
    head.close();

    let values = timeout(DEADLINE, results.collect_all()).await.unwrap();
    assert_eq!(values, ints([4, 6, 8, 10]));
}

/// reduce delivers its accumulator when the stage closes.
#[tokio::test]
async fn test_reduce_terminal_value() {
    let pipeline = pipeline();
    let stage = pipeline.reduce("add", 0).await.unwrap();

    stage.push(1..=10i64);
    stage.close();

    let terminal = timeout(DEADLINE, stage.closed()).await.unwrap().unwrap();
    assert_eq!(terminal, Some(Value::Int(55)));
}

/// chunk emits the partial chunk when closed.
#[tokio::test]
async fn test_chunk_trailing_output() {
    let pipeline = pipeline();
    let stage = pipeline.chunk(2).await.unwrap();
    let results = stage.results().unwrap();

    stage.push(1..=5i64);
    stage.close();

    let values = timeout(DEADLINE, results.collect_all()).await.unwrap();
    assert_eq!(
        values,
        vec![
            Value::from(vec![1, 2]),
            Value::from(vec![3, 4]),
            Value::from(vec![5])
        ]
    );
}

/// take stops forwarding after its count.
#[tokio::test]
async fn test_take() {
    let pipeline = pipeline();
    let stage = pipeline.take(3).await.unwrap();
    let results = stage.results().unwrap();

    stage.push(10..20i64);
    stage.close();

    let values = timeout(DEADLINE, results.collect_all()).await.unwrap();
    assert_eq!(values, ints([10, 11, 12]));
}

/// An unknown operation fails the apply and leaves no stage behind.
#[tokio::test]
async fn test_unknown_operation() {
    let pipeline = pipeline();
    let err = pipeline.apply("scatter", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::UnknownOperation(_)), "{err}");
    assert_eq!(pipeline.stages(), 0);
}

/// An unknown function is rejected at bind time.
#[tokio::test]
async fn test_unknown_function() {
    let pipeline = pipeline();
    let err = pipeline.map("no_such_function").await.unwrap_err();
    assert!(matches!(err, Error::UnknownFunction(_)), "{err}");
}

/// A worker that cannot start its scope fails the apply.
#[tokio::test]
async fn test_initializer_failure() {
    let config = PipelineConfig::default()
        .with_worker(WorkerCommand::new(env!("CARGO_BIN_EXE_forkline-worker")))
        .with_initializer(Initializer::named("missing-factory"));
    let pipeline = Pipeline::new(config).unwrap();

    let err = pipeline.map("inc").await.unwrap_err();
    assert!(matches!(err, Error::Initialization(_)), "{err}");
}

/// A worker that exits before answering is reported as a failure.
#[tokio::test]
async fn test_worker_exits_before_init() {
    let config = PipelineConfig::default().with_worker(WorkerCommand::new("true"));
    let pipeline = Pipeline::new(config).unwrap();

    let err = pipeline.map("inc").await.unwrap_err();
    assert!(
        matches!(err, Error::WorkerExited { .. } | Error::ChannelClosed),
        "{err}"
    );
}

/// kill terminates at once and releases the stage.
#[tokio::test]
async fn test_kill_is_immediate() {
    let pipeline = pipeline();
    let stage = pipeline.map("inc").await.unwrap();
    let mut events = stage.subscribe();
    let results = stage.results().unwrap();

    stage.push(1..=1000i64);
    stage.kill();

    assert_eq!(stage.lifecycle(), Lifecycle::Killed);
    assert!(matches!(stage.closed().await, Err(Error::Killed)));
    assert_eq!(pipeline.stages(), 0);

    // Later calls are no-ops.
    stage.push([1]);
    stage.close();
    assert_eq!(stage.lifecycle(), Lifecycle::Killed);

    // Give in-flight results time to arrive; none may surface after the kill.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut killed = false;
    let mut after_kill = Vec::new();
    while let Some(event) = events.try_recv() {
        if killed {
            after_kill.push(event);
        } else if matches!(event, StageEvent::Kill { .. }) {
            killed = true;
        }
    }
    assert!(killed);
    assert!(
        !after_kill
            .iter()
            .any(|e| matches!(e, StageEvent::Pull { .. } | StageEvent::Closed { .. })),
        "{after_kill:?}"
    );

    // The result stream ends.
    timeout(DEADLINE, results.collect_all()).await.unwrap();
    assert!(matches!(stage.map("inc").await, Err(Error::StageTerminated(_))));
}

/// Repeated close requests complete the stage exactly once.
#[tokio::test]
async fn test_close_completes_once() {
    let pipeline = pipeline();
    let stage = pipeline.map("inc").await.unwrap();
    let mut events = stage.subscribe();
    let results = stage.results().unwrap();

    stage.push([1, 2, 3]);
    stage.close();
    stage.close();
    stage.close();

    let values = timeout(DEADLINE, results.collect_all()).await.unwrap();
    assert_eq!(values, ints([2, 3, 4]));
    timeout(DEADLINE, stage.closed()).await.unwrap().unwrap();

    // Closing a closed stage does nothing.
    stage.close();

    let mut closed = 0;
    while let Some(event) = events.try_recv() {
        if matches!(event, StageEvent::Closed { .. }) {
            closed += 1;
        }
    }
    assert_eq!(closed, 1);
    assert_eq!(stage.lifecycle(), Lifecycle::Closed);
}

/// A worker dying mid-stream fails its stage and drains the successor.
#[tokio::test]
async fn test_worker_death_fails_stage() {
    let pipeline = pipeline();
    let head = pipeline.map("double").await.unwrap();
    let tail = head.map("identity").await.unwrap();
    let mut tail_events = tail.subscribe();
    let results = tail.results().unwrap();

    head.push([1, 2]);

    let mut pulled = 0;
    while pulled < 2 {
        match timeout(DEADLINE, tail_events.recv()).await.unwrap() {
            Some(StageEvent::Pull { .. }) => pulled += 1,
            Some(_) => {}
            None => panic!("tail events ended early"),
        }
    }

    let pid = head.pid().unwrap();
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    assert!(matches!(
        timeout(DEADLINE, head.closed()).await.unwrap(),
        Err(Error::WorkerExited { .. })
    ));
    assert_eq!(head.lifecycle(), Lifecycle::Failed);

    // The successor keeps what it received, then closes.
    let values = timeout(DEADLINE, results.collect_all()).await.unwrap();
    assert_eq!(values, ints([2, 4]));
    timeout(DEADLINE, tail.closed()).await.unwrap().unwrap();

    assert!(matches!(
        timeout(DEADLINE, pipeline.join()).await.unwrap(),
        Err(Error::WorkerExited { .. })
    ));
}

/// A stage accepts a single consumer.
#[tokio::test]
async fn test_single_consumer() {
    let pipeline = pipeline();
    let stage = pipeline.map("inc").await.unwrap();
    let _results = stage.results().unwrap();

    assert!(matches!(stage.results(), Err(Error::AlreadyLinked)));
    assert!(matches!(stage.map("double").await, Err(Error::AlreadyLinked)));
}

/// Push guards can veto values before they reach the worker.
#[tokio::test]
async fn test_push_guard_vetoes() {
    let pipeline = pipeline();
    let stage = pipeline.map("inc").await.unwrap();
    stage.on_push(|values| values.iter().all(|v| v.as_int() != Some(13)));
    let results = stage.results().unwrap();

    stage.push([1]).push([13]).push([2]);
    stage.close();

    let values = timeout(DEADLINE, results.collect_all()).await.unwrap();
    assert_eq!(values, ints([2, 3]));
}

/// A close guard returning false keeps the stage active.
#[tokio::test]
async fn test_close_guard_vetoes() {
    let pipeline = pipeline();
    let stage = pipeline.map("inc").await.unwrap();
    stage.on_close(|| false);

    stage.close();
    assert_eq!(stage.lifecycle(), Lifecycle::Active);

    stage.kill();
    assert_eq!(stage.lifecycle(), Lifecycle::Killed);
}

/// A drained stage ignores pushes and treats close as kill.
#[tokio::test]
async fn test_drain_turns_close_into_kill() {
    let pipeline = pipeline();
    let stage = pipeline.map("inc").await.unwrap().drain();

    stage.push([1, 2, 3]);
    stage.close();

    assert!(matches!(stage.closed().await, Err(Error::Killed)));
}

/// Faulting items produce events and no results.
#[tokio::test]
async fn test_faults_reported_as_events() {
    let pipeline = pipeline();
    let stage = pipeline.map("double").await.unwrap();
    let mut events = stage.subscribe();
    let results = stage.results().unwrap();

    stage.push(vec![Value::Int(1), Value::from("x"), Value::Int(3)]);
    stage.close();

    let values = timeout(DEADLINE, results.collect_all()).await.unwrap();
    assert_eq!(values, ints([2, 6]));

    let mut faults = 0;
    while let Some(event) = timeout(DEADLINE, events.recv()).await.unwrap() {
        match event {
            StageEvent::Fault { .. } => faults += 1,
            StageEvent::Closed { terminal, .. } => {
                assert_eq!(terminal, None);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(faults, 1);
}

/// Named stages are found until they terminate.
#[tokio::test]
async fn test_named_stage_lookup() {
    let pipeline = pipeline();
    let stage = pipeline.map("inc").await.unwrap().as_name("incr");

    assert_eq!(pipeline.get("incr"), Some(stage.clone()));
    assert!(pipeline.get("other").is_none());

    stage.kill();
    assert!(pipeline.get("incr").is_none());
}

/// join waits for every stage to close.
#[tokio::test]
async fn test_join() {
    let pipeline = pipeline();
    let head = pipeline.map("square").await.unwrap();
    let sum = head.reduce("add", 0).await.unwrap();

    head.push([1, 2, 3]);
    head.close();

    timeout(DEADLINE, pipeline.join()).await.unwrap().unwrap();
    assert_eq!(pipeline.stages(), 0);
    assert_eq!(sum.closed().await.unwrap(), Some(Value::Int(14)));
}

/// Dropping the pipeline kills its stages.
#[tokio::test]
async fn test_drop_kills_stages() {
    let pipeline = pipeline();
    let stage = pipeline.map("inc").await.unwrap();
    drop(pipeline);

    assert_eq!(stage.lifecycle(), Lifecycle::Killed);
}
