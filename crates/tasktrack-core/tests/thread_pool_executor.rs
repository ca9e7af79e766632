use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use tasktrack_core::execution::{CompletionHandler, TaskExecutor, ThreadPoolExecutor};
use tasktrack_core::models::{TaskArguments, TaskCall, TaskErrorKind, TaskId, TaskOutcome};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Started(TaskId),
    Completed(TaskId, TaskOutcome),
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn wait_for_completions(&self, count: usize) -> Vec<Event> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let events = self.events();
            let completed = events
                .iter()
                .filter(|event| matches!(event, Event::Completed(..)))
                .count();
            if completed >= count {
                return events;
            }
            assert!(Instant::now() < deadline, "only {completed} completions arrived");
            thread::sleep(Duration::from_millis(2));
        }
    }
}

impl CompletionHandler for RecordingHandler {
    fn on_start(&self, task_id: &TaskId) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Started(task_id.clone()));
    }

    fn on_complete(&self, task_id: &TaskId, outcome: TaskOutcome) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Completed(task_id.clone(), outcome));
    }
}

fn sleepy(millis: u64, value: i64) -> TaskCall {
    TaskCall::new(
        "sleepy",
        move |_: &TaskArguments| {
            thread::sleep(Duration::from_millis(millis));
            Ok(json!(value))
        },
        TaskArguments::new(),
    )
}

#[test]
fn zero_workers_is_rejected() {
    let error = ThreadPoolExecutor::new(0).err().expect("zero workers must fail");
    assert_eq!(error.kind, TaskErrorKind::InvalidInput);
}

#[test]
fn each_task_starts_then_completes_exactly_once() {
    let executor = ThreadPoolExecutor::new(2).unwrap();
    let handler = Arc::new(RecordingHandler::default());

    for index in 0..4 {
        executor
            .submit(TaskId::new(format!("t{index}")), sleepy(5, index), handler.clone())
            .unwrap();
    }
    executor.shutdown(true).unwrap();

    let events = handler.events();
    for index in 0..4 {
        let task_id = TaskId::new(format!("t{index}"));
        let started = events
            .iter()
            .position(|event| *event == Event::Started(task_id.clone()))
            .expect("start event");
        let completions: Vec<_> = events
            .iter()
            .enumerate()
            .filter(|(_, event)| matches!(event, Event::Completed(id, _) if *id == task_id))
            .collect();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].0 > started);
        assert_eq!(
            completions[0].1,
            &Event::Completed(task_id, TaskOutcome::Completed(json!(index)))
        );
    }
}

#[test]
fn pool_size_bounds_parallelism() {
    let executor = ThreadPoolExecutor::new(2).unwrap();
    assert_eq!(executor.max_workers(), 2);
    let handler = Arc::new(RecordingHandler::default());

    let started = Instant::now();
    for index in 0..4 {
        executor
            .submit(TaskId::new(format!("t{index}")), sleepy(60, index), handler.clone())
            .unwrap();
    }
    handler.wait_for_completions(4);
    assert!(started.elapsed() >= Duration::from_millis(120));
}

#[test]
fn cancelled_queued_task_never_reports() {
    let executor = ThreadPoolExecutor::new(1).unwrap();
    let handler = Arc::new(RecordingHandler::default());
    executor
        .submit(TaskId::from("busy"), sleepy(50, 1), handler.clone())
        .unwrap();
    executor
        .submit(TaskId::from("queued"), sleepy(0, 2), handler.clone())
        .unwrap();

    assert!(executor.cancel(&TaskId::from("queued")).unwrap());
    assert!(!executor.cancel(&TaskId::from("queued")).unwrap());
    assert!(!executor.cancel(&TaskId::from("unknown")).unwrap());
    executor.shutdown(true).unwrap();

    let events = handler.events();
    let touched_queued = events.iter().any(|event| match event {
        Event::Started(id) | Event::Completed(id, _) => id.as_str() == "queued",
    });
    assert!(!touched_queued);
    assert_eq!(executor.in_flight(), 0);
}

#[test]
fn in_flight_ids_cannot_be_reused() {
    let executor = ThreadPoolExecutor::new(1).unwrap();
    let handler = Arc::new(RecordingHandler::default());
    executor
        .submit(TaskId::from("dup"), sleepy(50, 1), handler.clone())
        .unwrap();
    let error = executor
        .submit(TaskId::from("dup"), sleepy(0, 2), handler.clone())
        .unwrap_err();
    assert_eq!(error.kind, TaskErrorKind::InvalidInput);
    executor.shutdown(true).unwrap();
}

#[test]
fn shutdown_is_idempotent_and_closes_submission() {
    let executor = ThreadPoolExecutor::new(1).unwrap();
    let handler = Arc::new(RecordingHandler::default());
    executor.shutdown(true).unwrap();
    executor.shutdown(false).unwrap();

    let error = executor
        .submit(TaskId::from("late"), sleepy(0, 1), handler.clone())
        .unwrap_err();
    assert_eq!(error.kind, TaskErrorKind::ExecutorUnavailable);
    assert!(handler.events().is_empty());
}

#[test]
fn bounded_shutdown_gives_up_on_stuck_work() {
    let executor = ThreadPoolExecutor::new(1)
        .unwrap()
        .with_shutdown_timeout(Duration::from_millis(30));
    let handler = Arc::new(RecordingHandler::default());
    executor
        .submit(TaskId::from("slow"), sleepy(300, 1), handler.clone())
        .unwrap();

    let started = Instant::now();
    executor.shutdown(true).unwrap();
    assert!(started.elapsed() < Duration::from_millis(250));
}

#[test]
fn unbounded_shutdown_waits_for_work() {
    let executor = ThreadPoolExecutor::new(1)
        .unwrap()
        .with_shutdown_timeout(Duration::MAX);
    let handler = Arc::new(RecordingHandler::default());
    executor
        .submit(TaskId::from("slow"), sleepy(30, 7), handler.clone())
        .unwrap();

    executor.shutdown(true).unwrap();
    assert_eq!(
        handler.events().last(),
        Some(&Event::Completed(
            TaskId::from("slow"),
            TaskOutcome::Completed(json!(7))
        ))
    );
}
