mod common;

use common::strategies::*;
use common::*;
use proptest::prelude::*;
use std::collections::HashMap;
use tasker_engine::models::{TaskRequest, TaskTemplate};
use tasker_engine::orchestration::{DependencyGraphAnalyzer, GraphValidationError};
use tasker_engine::state_machine::WorkflowStepState;

proptest! {
    /// Property: every dependency precedes its dependent in topological order
    #[test]
    fn topological_order_respects_dependencies(graph in acyclic_graph_strategy(12)) {
        let analysis = DependencyGraphAnalyzer::from_edges(graph.clone()).analyze().unwrap();
        prop_assert!(!analysis.has_cycles);
        prop_assert_eq!(analysis.topological_order.len(), graph.len());

        let position: HashMap<&str, usize> = analysis
            .topological_order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        for (step, deps) in &graph {
            for dep in deps {
                prop_assert!(position[dep.as_str()] < position[step.as_str()]);
            }
        }
    }

    /// Property: a step's level is one more than its deepest dependency
    #[test]
    fn levels_follow_longest_dependency_path(graph in acyclic_graph_strategy(12)) {
        let analysis = DependencyGraphAnalyzer::from_edges(graph.clone()).analyze().unwrap();
        for (step, deps) in &graph {
            let expected = deps
                .iter()
                .map(|d| analysis.level_of(d).unwrap() + 1)
                .max()
                .unwrap_or(0);
            prop_assert_eq!(analysis.level_of(step), Some(expected));
        }
        let grouped: usize = analysis.steps_by_level().iter().map(Vec::len).sum();
        prop_assert_eq!(grouped, graph.len());
    }

    /// Property: roots have no dependencies and leaves have no dependents
    #[test]
    fn roots_and_leaves_are_consistent(graph in acyclic_graph_strategy(12)) {
        let analysis = DependencyGraphAnalyzer::from_edges(graph.clone()).analyze().unwrap();
        for root in &analysis.roots {
            let (_, deps) = graph.iter().find(|(n, _)| n == root).unwrap();
            prop_assert!(deps.is_empty());
        }
        for leaf in &analysis.leaves {
            prop_assert!(graph.iter().all(|(_, deps)| !deps.contains(leaf)));
        }
    }

    /// Property: closing a chain with a back edge is always reported as a cycle
    #[test]
    fn back_edges_are_detected_as_cycles(graph in cyclic_graph_strategy(10)) {
        let analysis = DependencyGraphAnalyzer::from_edges(graph.clone()).analyze().unwrap();
        prop_assert!(analysis.has_cycles);
        let cycle = analysis.cycle.clone().unwrap();
        prop_assert_eq!(cycle.first(), cycle.last());
        let is_cycle_error = matches!(
            analysis.ensure_valid(50),
            Err(GraphValidationError::Cycle { .. })
        );
        prop_assert!(is_cycle_error);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: any acyclic template runs every step exactly once, dependencies first
    #[test]
    fn generated_workflows_complete_in_dependency_order(graph in acyclic_graph_strategy(8)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let log = ExecutionLog::new();
            let template = template_yaml("generated", &graph);
            prop_assert!(TaskTemplate::from_yaml(&template).is_ok());

            let (coordinator, store) = TestEngine::new()
                .handler("record", recording_handler(log.clone()))
                .template(&template)
                .build();

            let result = coordinator
                .submit_and_execute(TaskRequest::new("generated", "generated"))
                .await
                .unwrap();
            prop_assert!(result.is_complete());

            for (step, deps) in &graph {
                prop_assert_eq!(log.count(step), 1);
                let position = log.position(step).unwrap();
                for dep in deps {
                    prop_assert!(log.position(dep).unwrap() < position);
                }
                let stored = step_named(store.as_ref(), result.task_id(), step).await;
                prop_assert_eq!(stored.current_state, WorkflowStepState::Complete);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
