//! Workflow step ordering and dependency planning.

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;

use crate::error::DriverError;
use crate::model::StepDefinition;

/// Build a topologically ordered list of every registered step.
///
/// Independent steps keep their registration order. Returns an error for
/// unknown dependencies or cycles (a step depending on itself is a cycle).
pub fn order_steps_for_execution(steps: &IndexMap<String, StepDefinition>) -> Result<Vec<&StepDefinition>, DriverError> {
    let members: HashSet<&str> = steps.keys().map(String::as_str).collect();
    order_members(steps, &members)
}

/// Ordered plan for running `target`: its transitive dependencies followed by
/// the target itself. Cycles elsewhere in the workflow do not affect it.
pub fn plan_for_target<'a>(steps: &'a IndexMap<String, StepDefinition>, target: &str) -> Result<Vec<&'a StepDefinition>, DriverError> {
    if !steps.contains_key(target) {
        return Err(DriverError::UnknownStep { name: target.to_string() });
    }

    let mut members: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = vec![target];
    while let Some(step_id) = stack.pop() {
        if !members.insert(step_id) {
            continue;
        }
        let Some(step) = steps.get(step_id) else {
            continue;
        };
        for dependency in step.all_dependencies()? {
            let Some((_, known, _)) = steps.get_full(&dependency) else {
                return Err(DriverError::UnknownDependency {
                    step: step_id.to_string(),
                    dependency,
                });
            };
            stack.push(known.as_str());
        }
    }

    order_members(steps, &members)
}

fn order_members<'a>(steps: &'a IndexMap<String, StepDefinition>, members: &HashSet<&str>) -> Result<Vec<&'a StepDefinition>, DriverError> {
    let mut in_degrees: HashMap<usize, usize> = HashMap::new();
    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();

    for (index, (step_id, step)) in steps.iter().enumerate() {
        if !members.contains(step_id.as_str()) {
            continue;
        }
        in_degrees.entry(index).or_insert(0);
        for dependency in step.all_dependencies()? {
            let Some(dependency_index) = steps.get_index_of(&dependency) else {
                return Err(DriverError::UnknownDependency {
                    step: step_id.clone(),
                    dependency,
                });
            };
            *in_degrees.entry(index).or_insert(0) += 1;
            adjacency.entry(dependency_index).or_default().push(index);
        }
    }

    let mut ready: BTreeSet<usize> = in_degrees.iter().filter(|(_, degree)| **degree == 0).map(|(index, _)| *index).collect();

    let mut ordered = Vec::with_capacity(in_degrees.len());
    while let Some(index) = ready.pop_first() {
        ordered.push(index);

        if let Some(children) = adjacency.get(&index) {
            for child in children {
                if let Some(degree) = in_degrees.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }
    }

    if ordered.len() != in_degrees.len() {
        let mut remaining: Vec<usize> = in_degrees.into_iter().filter(|(_, degree)| *degree > 0).map(|(index, _)| index).collect();
        remaining.sort_unstable();
        let steps = remaining
            .into_iter()
            .filter_map(|index| steps.get_index(index).map(|(step_id, _)| step_id.clone()))
            .collect();
        return Err(DriverError::Cycle { steps });
    }

    Ok(ordered.into_iter().filter_map(|index| steps.get_index(index).map(|(_, step)| step)).collect())
}
