use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tasker_engine::models::{evaluate_step_readiness, WorkflowStep, WorkflowStepEdge};
use tasker_engine::orchestration::DependencyGraphAnalyzer;
use uuid::Uuid;

/// A layered DAG: `width` steps per level, each depending on every step of the previous level
fn layered_graph(levels: usize, width: usize) -> Vec<(String, Vec<String>)> {
    let mut steps = Vec::with_capacity(levels * width);
    for level in 0..levels {
        for i in 0..width {
            let deps = if level == 0 {
                Vec::new()
            } else {
                (0..width).map(|j| format!("step_{}_{j}", level - 1)).collect()
            };
            steps.push((format!("step_{level}_{i}"), deps));
        }
    }
    steps
}

fn materialize(graph: &[(String, Vec<String>)]) -> (Vec<WorkflowStep>, Vec<WorkflowStepEdge>) {
    let task_id = Uuid::new_v4();
    let steps: Vec<WorkflowStep> = graph
        .iter()
        .enumerate()
        .map(|(i, (name, _))| WorkflowStep::new(task_id, name.clone(), i as i32, true, 3, false))
        .collect();
    let id_of = |name: &str| {
        steps
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.workflow_step_id)
    };
    let mut edges = Vec::new();
    for (name, deps) in graph {
        for dep in deps {
            if let (Some(from), Some(to)) = (id_of(dep), id_of(name)) {
                edges.push(WorkflowStepEdge {
                    task_id,
                    from_step_id: from,
                    to_step_id: to,
                    name: "provides".to_string(),
                });
            }
        }
    }
    (steps, edges)
}

fn benchmark_graph_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_graph_analysis");
    for (levels, width) in [(5, 2), (10, 5), (20, 10)] {
        let graph = layered_graph(levels, width);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{levels}x{width}")),
            &graph,
            |b, graph| {
                b.iter(|| {
                    let analyzer = DependencyGraphAnalyzer::from_edges(
                        graph.iter().map(|(n, d)| (n.clone(), d.clone())),
                    );
                    black_box(analyzer.analyze())
                })
            },
        );
    }
    group.finish();
}

fn benchmark_step_readiness(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_readiness");
    for (levels, width) in [(5, 2), (10, 5), (20, 10)] {
        let (steps, edges) = materialize(&layered_graph(levels, width));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{levels}x{width}")),
            &(steps, edges),
            |b, (steps, edges)| b.iter(|| black_box(evaluate_step_readiness(steps, edges, Utc::now()))),
        );
    }
    group.finish();
}

criterion_group!(benches, benchmark_graph_analysis, benchmark_step_readiness);
criterion_main!(benches);
