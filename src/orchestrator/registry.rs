use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::error::OrchestratorError;
use crate::jobs::Job;

/// Named jobs known to one process, built explicitly at startup
#[derive(Default)]
pub struct JobRegistry {
    jobs: BTreeMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job: Arc<dyn Job>) -> Result<(), OrchestratorError> {
        let name = job.name().to_string();
        if self.jobs.contains_key(&name) {
            return Err(OrchestratorError::DuplicateJob(name));
        }
        self.jobs.insert(name, job);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Job>> {
        self.jobs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Every dependency exists and the graph is acyclic
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let all: Vec<Arc<dyn Job>> = self.jobs.values().cloned().collect();
        topological_order(&all).map(|_| ())
    }

    /// Jobs for a CLI target: `"all"`, or one job plus everything it
    /// transitively depends on
    pub fn select(&self, target: &str) -> Result<Vec<Arc<dyn Job>>, OrchestratorError> {
        if target == "all" {
            return Ok(self.jobs.values().cloned().collect());
        }

        let mut selected: BTreeMap<String, Arc<dyn Job>> = BTreeMap::new();
        let mut queue = VecDeque::from([target.to_string()]);

        while let Some(name) = queue.pop_front() {
            if selected.contains_key(&name) {
                continue;
            }
            let job = self
                .jobs
                .get(&name)
                .ok_or_else(|| OrchestratorError::UnknownJob(name.clone()))?;
            queue.extend(job.spec().dependencies.iter().cloned());
            selected.insert(name, Arc::clone(job));
        }

        Ok(selected.into_values().collect())
    }
}

/// Order jobs so every job comes after its dependencies. Ties keep name order.
pub fn topological_order(jobs: &[Arc<dyn Job>]) -> Result<Vec<String>, OrchestratorError> {
    let mut seen = BTreeSet::new();
    for job in jobs {
        if !seen.insert(job.name().to_string()) {
            return Err(OrchestratorError::DuplicateJob(job.name().to_string()));
        }
    }

    let mut remaining: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for job in jobs {
        for dependency in &job.spec().dependencies {
            if !seen.contains(dependency) {
                return Err(OrchestratorError::UnknownDependency {
                    job: job.name().to_string(),
                    dependency: dependency.clone(),
                });
            }
        }
        remaining.insert(
            job.name().to_string(),
            job.spec().dependencies.iter().cloned().collect(),
        );
    }

    let mut order = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| name.clone())
            .collect();

        if ready.is_empty() {
            let cycle: Vec<&str> = remaining.keys().map(String::as_str).collect();
            return Err(OrchestratorError::DependencyCycle(cycle.join(", ")));
        }

        for name in &ready {
            remaining.remove(name);
        }
        for deps in remaining.values_mut() {
            for name in &ready {
                deps.remove(name);
            }
        }
        order.extend(ready);
    }

    Ok(order)
}
