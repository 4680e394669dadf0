//! Execution unit lifecycle tests.
//!
//! Executors block on a `Barrier` or a channel so that the Running state can
//! be observed without sleeping on timing.

use std::sync::mpsc;
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};

use kiln::RuntimeConfig;
use kiln::vm::threads::{ExecutionUnit, UnitError, UnitState, executor_fn};
use kiln::vm::{Function, FunctionKind, Runtime, Value};

fn script(rt: &Runtime) -> Value {
    let module = rt.module_or_register("main", "main.k");
    Value::Obj(rt.new_function(Function::new(FunctionKind::Script, module)))
}

/// A unit whose executor waits at `gate` before returning `result`.
fn gated_unit(rt: Arc<Runtime>, gate: Arc<Barrier>, result: Value) -> ExecutionUnit {
    let callable = script(&rt);
    ExecutionUnit::new(
        rt,
        callable,
        executor_fn(move |_, _| {
            gate.wait();
            Ok(result)
        }),
    )
    .unwrap()
}

#[test]
fn test_lifecycle() {
    let rt = Arc::new(Runtime::new());
    let gate = Arc::new(Barrier::new(2));
    let unit = gated_unit(rt, Arc::clone(&gate), Value::Number(7.0));

    assert_eq!(unit.state(), UnitState::NotStarted);
    unit.start().unwrap();
    assert_eq!(unit.state(), UnitState::Running);

    assert_eq!(unit.start(), Err(UnitError::AlreadyRunning));
    assert_eq!(unit.state(), UnitState::Running);

    gate.wait();
    unit.join().unwrap();
    assert_eq!(unit.state(), UnitState::Completed);
    assert_eq!(unit.result(), Some(Ok(Value::Number(7.0))));

    assert_eq!(unit.start(), Err(UnitError::Exited));
    assert_eq!(unit.state(), UnitState::Completed);
}

#[test]
fn test_error_messages() {
    assert_eq!(UnitError::Exited.to_string(), "cannot start an exited unit");
    assert_eq!(
        UnitError::AlreadyRunning.to_string(),
        "unit already in running state"
    );
}

#[test]
fn test_join_not_started_returns_immediately() {
    let rt = Arc::new(Runtime::new());
    let unit = gated_unit(rt, Arc::new(Barrier::new(2)), Value::Nil);
    unit.join().unwrap();
    assert_eq!(unit.state(), UnitState::NotStarted);
    assert_eq!(unit.result(), None);
}

#[test]
fn test_join_completed_returns_immediately() {
    let rt = Arc::new(Runtime::new());
    let gate = Arc::new(Barrier::new(2));
    let unit = gated_unit(rt, Arc::clone(&gate), Value::Bool(true));
    unit.start().unwrap();
    gate.wait();
    unit.join().unwrap();
    unit.join().unwrap();
    assert_eq!(unit.state(), UnitState::Completed);
}

#[test]
fn test_join_from_several_threads() {
    let rt = Arc::new(Runtime::new());
    let gate = Arc::new(Barrier::new(2));
    let unit = Arc::new(gated_unit(rt, Arc::clone(&gate), Value::Nil));
    unit.start().unwrap();

    let joiners: Vec<_> = (0..3)
        .map(|_| {
            let unit = Arc::clone(&unit);
            std::thread::spawn(move || unit.join())
        })
        .collect();
    gate.wait();
    for joiner in joiners {
        assert_eq!(joiner.join().unwrap(), Ok(()));
    }
    assert_eq!(unit.state(), UnitState::Completed);
}

#[test]
fn test_copy_shares_callable() {
    let rt = Arc::new(Runtime::new());
    let gate = Arc::new(Barrier::new(2));
    let unit = gated_unit(rt, Arc::clone(&gate), Value::Number(1.0));
    unit.start().unwrap();
    gate.wait();
    unit.join().unwrap();

    let copy = unit.copy();
    assert_ne!(copy.id(), unit.id());
    assert_eq!(copy.callable(), unit.callable());
    assert_eq!(copy.state(), UnitState::NotStarted);

    copy.start().unwrap();
    gate.wait();
    copy.join().unwrap();
    assert_eq!(copy.state(), UnitState::Completed);
    assert_eq!(copy.result(), Some(Ok(Value::Number(1.0))));
}

#[test]
fn test_cooperative_cancel() {
    let rt = Arc::new(Runtime::new());
    let callable = script(&rt);
    let (ready_tx, ready_rx) = mpsc::channel();
    let ready_tx = Mutex::new(ready_tx);

    let unit = ExecutionUnit::new(
        rt,
        callable,
        executor_fn(move |_, ctx| {
            let _ = ready_tx.lock().unwrap().send(());
            loop {
                ctx.checkpoint()?;
                std::thread::sleep(Duration::from_millis(1));
            }
        }),
    )
    .unwrap();

    unit.start().unwrap();
    ready_rx.recv().unwrap();
    assert_eq!(unit.state(), UnitState::Running);

    unit.cancel().unwrap();
    unit.join().unwrap();
    assert_eq!(unit.state(), UnitState::Completed);
    assert_eq!(unit.result(), Some(Err("cancelled".to_string())));
}

#[test]
fn test_executor_sees_callable_and_runtime() {
    let rt = Arc::new(Runtime::new());
    let callable = script(&rt);
    let unit = ExecutionUnit::new(
        Arc::clone(&rt),
        callable,
        executor_fn(|callable, ctx| {
            let kind = ctx.runtime().object_type(&callable).unwrap_or("none");
            ctx.intern(kind);
            ctx.pop().ok_or_else(|| "empty stack".to_string())
        }),
    )
    .unwrap();

    unit.start().unwrap();
    unit.join().unwrap();
    let result = unit.result().unwrap().unwrap();
    assert_eq!(rt.string(result.as_obj().unwrap()).as_deref(), Some("function"));
}

#[test]
fn test_result_survives_collection() {
    let rt = Arc::new(Runtime::with_config(RuntimeConfig {
        gc_enabled: false,
        ..RuntimeConfig::default()
    }));
    let callable = script(&rt);
    let unit = ExecutionUnit::new(
        Arc::clone(&rt),
        callable,
        executor_fn(|_, ctx| Ok(Value::Obj(ctx.intern("kept")))),
    )
    .unwrap();

    unit.start().unwrap();
    unit.join().unwrap();
    rt.collect_garbage();

    let result = unit.result().unwrap().unwrap();
    assert_eq!(rt.string(result.as_obj().unwrap()).as_deref(), Some("kept"));
}

#[test]
fn test_custom_stack_size_and_prefix() {
    let rt = Arc::new(Runtime::with_config(RuntimeConfig {
        unit_stack_size: Some(256 * 1024),
        unit_name_prefix: "worker".to_string(),
        ..RuntimeConfig::default()
    }));
    let callable = script(&rt);
    let unit = ExecutionUnit::new(
        rt,
        callable,
        executor_fn(|_, _| {
            let name = std::thread::current().name().unwrap_or_default().to_string();
            Ok(Value::Bool(name.starts_with("worker-")))
        }),
    )
    .unwrap();

    unit.start().unwrap();
    unit.join().unwrap();
    assert_eq!(unit.result(), Some(Ok(Value::Bool(true))));
}

#[test]
fn test_dropping_running_unit_releases_roots() {
    let rt = Arc::new(Runtime::with_config(RuntimeConfig {
        gc_enabled: false,
        ..RuntimeConfig::default()
    }));
    let callable = script(&rt);
    let baseline = rt.heap().roots().len();

    let gate = Arc::new(Barrier::new(2));
    let executor_gate = Arc::clone(&gate);
    let unit = ExecutionUnit::new(
        Arc::clone(&rt),
        callable,
        executor_fn(move |_, ctx| {
            executor_gate.wait();
            Ok(Value::Obj(ctx.intern("late result")))
        }),
    )
    .unwrap();
    unit.start().unwrap();
    drop(unit);
    gate.wait();

    let deadline = Instant::now() + Duration::from_secs(10);
    while rt.heap().roots().len() != baseline {
        assert!(Instant::now() < deadline, "unit roots never released");
        std::thread::sleep(Duration::from_millis(1));
    }
    let stats = rt.collect_garbage();
    assert_eq!(stats.strings_removed, 1);
}

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
#[test]
fn test_failed_spawn_rolls_back_to_not_started() {
    let rt = Arc::new(Runtime::with_config(RuntimeConfig {
        // Larger than the address space, so thread creation fails
        unit_stack_size: Some(1 << 50),
        ..RuntimeConfig::default()
    }));
    let unit = gated_unit(rt, Arc::new(Barrier::new(2)), Value::Nil);

    assert!(matches!(unit.start(), Err(UnitError::Os(_))));
    assert_eq!(unit.state(), UnitState::NotStarted);
    assert_eq!(unit.join(), Ok(()));
    assert_eq!(unit.result(), None);
}
