use proptest::prelude::*;

/// Strategy for generating valid step names
pub fn step_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}"
}

/// Strategy for generating acyclic step graphs as `(name, dependencies)` in declaration order.
///
/// Step `i` may only depend on steps declared before it, so every generated
/// graph is a DAG.
pub fn acyclic_graph_strategy(max_steps: usize) -> impl Strategy<Value = Vec<(String, Vec<String>)>> {
    (1..=max_steps)
        .prop_flat_map(|n| {
            let masks = (0..n)
                .map(|i| prop::collection::vec(any::<bool>(), i))
                .collect::<Vec<_>>();
            (Just(n), masks)
        })
        .prop_map(|(n, masks)| {
            (0..n)
                .map(|i| {
                    let deps = masks[i]
                        .iter()
                        .enumerate()
                        .filter(|(_, &keep)| keep)
                        .map(|(j, _)| format!("step_{j}"))
                        .collect();
                    (format!("step_{i}"), deps)
                })
                .collect()
        })
}

/// An acyclic graph with one back edge added, closing a cycle
pub fn cyclic_graph_strategy(max_steps: usize) -> impl Strategy<Value = Vec<(String, Vec<String>)>> {
    (2..=max_steps.max(2))
        .prop_flat_map(|n| (Just(n), 0..n - 1))
        .prop_map(|(n, from)| {
            // chain step_0 <- step_1 <- ... <- step_{n-1}, then step_from depends on the last
            (0..n)
                .map(|i| {
                    let mut deps = Vec::new();
                    if i > 0 {
                        deps.push(format!("step_{}", i - 1));
                    }
                    if i == from {
                        deps.push(format!("step_{}", n - 1));
                    }
                    (format!("step_{i}"), deps)
                })
                .collect()
        })
}

/// Render a generated graph as task template YAML
pub fn template_yaml(name: &str, graph: &[(String, Vec<String>)]) -> String {
    let mut yaml = format!("name: {name}\nnamespace_name: generated\nversion: 1.0.0\nsteps:\n");
    for (step, deps) in graph {
        yaml.push_str(&format!("  - name: {step}\n    handler:\n      callable: record\n"));
        if !deps.is_empty() {
            yaml.push_str("    dependencies:\n");
            for dep in deps {
                yaml.push_str(&format!("      - {dep}\n"));
            }
        }
    }
    yaml
}
