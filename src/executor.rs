//! The boundary between the scheduler and whatever runs a command.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use crate::error::ExecError;
use crate::expr::Expr;
use crate::scope::Frame;
use crate::value::Value;

/// Resource limits of a single attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Budget {
    /// Wall-clock limit, enforced by the engine.
    pub elapsed: Option<Duration>,
    /// CPU limit, enforced by the executor.
    pub cpu: Option<Duration>,
}

/// Everything needed to build one target.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub target: String,
    pub command: Arc<Expr>,
    /// Dependency values and imports visible to the command.
    pub frame: Frame,
    pub seed: u64,
    pub resources: BTreeMap<String, String>,
    pub budget: Budget,
}

/// Runs commands on behalf of the scheduler.
///
/// Implementations may evaluate in-process, like the
/// [`Interpreter`](crate::Interpreter), or ship the request to a remote
/// worker and block until it answers. Either way the call is blocking; the
/// scheduler provides the concurrency.
pub trait Executor: Send + Sync {
    fn execute(&self, request: &ExecRequest) -> Result<Value, ExecError>;

    /// Evaluates a trigger expression.
    fn evaluate(&self, expr: &Expr, frame: &Frame, seed: u64) -> Result<Value, ExecError>;
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, request: &ExecRequest) -> Result<Value, ExecError> {
        (**self).execute(request)
    }

    fn evaluate(&self, expr: &Expr, frame: &Frame, seed: u64) -> Result<Value, ExecError> {
        (**self).evaluate(expr, frame, seed)
    }
}

/// Executes a request within its wall-clock budget.
///
/// With a budget the call runs on a watchdog thread. When the budget runs
/// out the thread is abandoned, it can't be killed, and the attempt counts
/// as a timeout.
pub(crate) fn run(executor: &Arc<dyn Executor>, request: ExecRequest) -> Result<Value, ExecError> {
    let Some(limit) = request.budget.elapsed else {
        return guarded(|| executor.execute(&request));
    };

    let (sender, receiver) = crossbeam_channel::bounded(1);
    let executor = executor.clone();
    let name = request.target.clone();

    std::thread::Builder::new()
        .name(format!("nagare:{name}"))
        .spawn(move || {
            let result = guarded(|| executor.execute(&request));
            // the receiver is gone after a timeout
            let _ = sender.send(result);
        })
        .map_err(|err| ExecError::Infrastructure(err.into()))?;

    match receiver.recv_timeout(limit) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!("Target '{name}' exceeded {limit:.2?}, abandoning its worker");
            Err(ExecError::Timeout(limit))
        }
        Err(RecvTimeoutError::Disconnected) => Err(ExecError::Infrastructure(anyhow::anyhow!(
            "Worker of '{name}' exited without a result"
        ))),
    }
}

/// Turns a panic in user code into an error.
pub(crate) fn guarded<T>(f: impl FnOnce() -> Result<T, ExecError>) -> Result<T, ExecError> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
        .unwrap_or_else(|panic| Err(ExecError::User(anyhow::anyhow!(panic_message(panic)))))
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Base;

    struct Sleepy;

    impl Executor for Sleepy {
        fn execute(&self, request: &ExecRequest) -> Result<Value, ExecError> {
            match request.target.as_str() {
                "slow" => {
                    std::thread::sleep(Duration::from_millis(500));
                    Ok(Value::Null)
                }
                "panic" => panic!("oh no"),
                _ => Ok(Value::Int(1)),
            }
        }

        fn evaluate(&self, _: &Expr, _: &Frame, _: u64) -> Result<Value, ExecError> {
            Ok(Value::Null)
        }
    }

    fn request(target: &str, elapsed: Option<Duration>) -> ExecRequest {
        ExecRequest {
            target: target.into(),
            command: Arc::new(Expr::Null),
            frame: Frame::new(Arc::new(Base::default())),
            seed: 0,
            resources: BTreeMap::new(),
            budget: Budget { elapsed, cpu: None },
        }
    }

    #[test]
    fn test_run_inline() {
        let executor: Arc<dyn Executor> = Arc::new(Sleepy);
        assert_eq!(run(&executor, request("fast", None)).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_timeout() {
        let executor: Arc<dyn Executor> = Arc::new(Sleepy);
        let result = run(&executor, request("slow", Some(Duration::from_millis(20))));
        assert!(matches!(result, Err(ExecError::Timeout(_))));

        let result = run(&executor, request("fast", Some(Duration::from_secs(5))));
        assert_eq!(result.unwrap(), Value::Int(1));
    }

    #[test]
    fn test_panic_is_user_error() {
        let executor: Arc<dyn Executor> = Arc::new(Sleepy);
        for elapsed in [None, Some(Duration::from_secs(5))] {
            let err = run(&executor, request("panic", elapsed)).unwrap_err();
            assert!(matches!(err, ExecError::User(_)));
            assert!(err.to_string().contains("oh no"));
        }
    }
}
