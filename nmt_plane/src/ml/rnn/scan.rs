use anyhow::{anyhow, Result};
use tracing::trace;

/// A recurrence over a time axis: `(state_t-1, inputs_t) -> (state_t, output_t)`.
pub trait Step {
    type State: Clone;
    type Output;

    fn len(&self) -> usize;

    fn step(&self, t: usize, state: &Self::State) -> Result<(Self::State, Self::Output)>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct ScanOutput<S, O> {
    pub outputs: Vec<O>,
    pub final_state: S,
}

/// Runs every step in order, collecting the per-step outputs by time.
pub fn scan<T: Step>(step: &T, init: T::State) -> Result<ScanOutput<T::State, T::Output>> {
    let mut outputs = Vec::with_capacity(step.len());
    let mut state = init;

    for t in 0..step.len() {
        let (next, output) = step.step(t, &state)?;
        outputs.push(output);
        state = next;
    }
    trace!(steps = outputs.len(), "completed scan");

    Ok(ScanOutput {
        outputs,
        final_state: state,
    })
}

/// Runs the single step `t` from an explicit previous state.
pub fn scan_one<T: Step>(
    step: &T,
    t: usize,
    state: Option<&T::State>,
) -> Result<(T::State, T::Output)> {
    let state = state.ok_or_else(|| anyhow!("single step mode requires a previous state"))?;
    if t >= step.len() {
        return Err(anyhow!("step {t} is out of range for {} steps", step.len()));
    }
    step.step(t, state)
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    struct RunningSum(Vec<i32>);

    impl Step for RunningSum {
        type State = i32;
        type Output = i32;

        fn len(&self) -> usize {
            self.0.len()
        }

        fn step(&self, t: usize, state: &i32) -> Result<(i32, i32)> {
            let next = state + self.0[t];
            Ok((next, next * 10))
        }
    }

    #[test]
    fn scan_collects_outputs_in_order() {
        let output = scan(&RunningSum(vec![1, 2, 3]), 0).unwrap();
        assert_eq!(output.outputs, vec![10, 30, 60]);
        assert_eq!(output.final_state, 6);
    }

    #[test]
    fn scan_one_requires_previous_state() {
        let step = RunningSum(vec![5]);
        assert!(scan_one(&step, 0, None).is_err());
        assert!(scan_one(&step, 1, Some(&0)).is_err());
        assert_eq!(scan_one(&step, 0, Some(&2)).unwrap(), (7, 70));
    }
}
