use failsafe::{backoff, failure_policy, Config};
use std::time::Duration;

/// Concrete state machine type for the scoring-provider breaker, named so
/// it can live in a struct field.
pub type ScoringBreaker = failsafe::StateMachine<
    failure_policy::ConsecutiveFailures<backoff::Exponential>,
    (),
>;

/// Creates a circuit breaker for scoring-provider calls so a hard provider
/// outage fails fast instead of burning the retry budget per lead.
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
pub fn create_scoring_circuit_breaker() -> ScoringBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use failsafe::{CircuitBreaker, Error};

    #[test]
    fn circuit_opens_after_consecutive_failures() {
        let cb = create_scoring_circuit_breaker();

        for _ in 0..5 {
            let result: Result<(), Error<&str>> = cb.call(|| Err::<(), &str>("provider down"));
            assert!(result.is_err());
        }

        // Next call should be rejected (circuit is open)
        let result: Result<(), Error<&str>> = cb.call(|| Ok::<(), &str>(()));
        match result {
            Err(Error::Rejected) => {}
            _ => panic!("expected circuit to be open and reject requests"),
        }
    }

    #[test]
    fn circuit_passes_successes_through() {
        let cb = create_scoring_circuit_breaker();
        let result: Result<i32, Error<&str>> = cb.call(|| Ok::<i32, &str>(42));
        assert_eq!(result.unwrap(), 42);
    }
}
