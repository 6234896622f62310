//! Splits a multi-entry module graph into independently loadable chunks.
//!
//! Factoring happens in two passes. First every module is assigned to the
//! single entry point that reaches it, or to [`COMMON`] when it is reachable
//! from several entries (or from none). Then every non-common group is cut
//! into consecutive chunks whose cumulative size stays under a ceiling.
//!
//! Modules are always visited in id order, so identical inputs produce
//! byte-identical chunks.
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use futures::{StreamExt, TryStreamExt, stream};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use crate::bundle::ModuleRecord;
use crate::error::{FactorError, PipelineError};
use crate::pipeline::{Packet, Step, from_fn};

/// Label of the group holding modules shared between entry points.
pub const COMMON: &str = "common";

/// Default chunk size ceiling in bytes.
pub const DEFAULT_SIZE_LIMIT: usize = 2_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleGroup {
    /// Name of the physical chunk, e.g. `ui-0`.
    pub label: String,
    /// Entry label the chunk belongs to, or [`COMMON`].
    pub parent: String,
    /// Members, sorted by id.
    pub modules: Vec<ModuleRecord>,
}

impl ModuleGroup {
    fn new(label: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            parent: parent.into(),
            modules: Vec::new(),
        }
    }

    /// Cumulative byte size of all members.
    pub fn size(&self) -> usize {
        self.modules.iter().map(ModuleRecord::size).sum()
    }

    pub fn is_common(&self) -> bool {
        self.parent == COMMON
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|m| m.id.as_str())
    }
}

/// Entry label (or [`COMMON`]) to the ordered labels of its chunks.
pub type GroupingMap = BTreeMap<String, Vec<String>>;

/// Numeric ids compare as numbers, anything else lexically after them.
fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn sort_modules(modules: &mut [ModuleRecord]) {
    modules.sort_by(|a, b| compare_ids(&a.id, &b.id));
}

/// Assign every module to exactly one group by entry reachability. The
/// common group comes first, then one group per entry ordered by label.
pub fn group_by_factor(mut modules: Vec<ModuleRecord>) -> Result<Vec<ModuleGroup>, FactorError> {
    sort_modules(&mut modules);

    let mut graph = DiGraph::<usize, ()>::with_capacity(modules.len(), modules.len());
    let nodes: HashMap<&str, NodeIndex> = modules
        .iter()
        .enumerate()
        .map(|(i, module)| (module.id.as_str(), graph.add_node(i)))
        .collect();

    for module in &modules {
        let from = nodes[module.id.as_str()];
        for dep in module.dep_ids() {
            let to = nodes
                .get(dep)
                .ok_or_else(|| FactorError::MissingModule(module.id.clone(), dep.to_string()))?;
            graph.add_edge(from, *to, ());
        }
    }

    let mut entries: BTreeMap<&str, &ModuleRecord> = BTreeMap::new();
    for module in modules.iter().filter(|m| m.entry) {
        if module.label() == COMMON {
            return Err(FactorError::ReservedEntryLabel(
                module.file.clone(),
                COMMON.to_string(),
            ));
        }
        if let Some(other) = entries.insert(module.label(), module) {
            return Err(FactorError::DuplicateEntryLabel(
                other.file.clone(),
                module.file.clone(),
                module.label().to_string(),
            ));
        }
    }

    let mut reached_by: Vec<BTreeSet<&str>> = vec![BTreeSet::new(); modules.len()];
    for (label, entry) in &entries {
        let mut dfs = Dfs::new(&graph, nodes[entry.id.as_str()]);
        while let Some(node) = dfs.next(&graph) {
            reached_by[graph[node]].insert(label);
        }
    }

    let mut common = ModuleGroup::new(COMMON, COMMON);
    let mut groups: BTreeMap<&str, ModuleGroup> = entries
        .keys()
        .map(|label| (*label, ModuleGroup::new(*label, *label)))
        .collect();

    for (module, reach) in modules.iter().zip(&reached_by) {
        let target = match reach.first() {
            Some(label) if reach.len() == 1 => groups.get_mut(label),
            _ => None,
        };

        match target {
            Some(group) => group.modules.push(module.clone()),
            None => common.modules.push(module.clone()),
        }
    }

    Ok(std::iter::once(common).chain(groups.into_values()).collect())
}

/// Cut every non-common group into chunks of at most `limit` bytes. A module
/// larger than the limit ends up alone in its chunk, and an empty group still
/// yields one empty chunk. Chunks are labelled `<parent>-<n>`.
pub fn group_by_size(groups: Vec<ModuleGroup>, limit: usize) -> Vec<ModuleGroup> {
    let mut chunks = Vec::new();

    for group in groups {
        let parent = group.parent;
        let chunk = |n: usize| ModuleGroup::new(format!("{parent}-{n}"), parent.as_str());

        if parent == COMMON {
            chunks.push(ModuleGroup {
                modules: group.modules,
                ..chunk(0)
            });
            continue;
        }

        let mut current = chunk(0);
        let mut size = 0;
        let mut n = 0;

        for module in group.modules {
            if !current.modules.is_empty() && size + module.size() > limit {
                n += 1;
                chunks.push(std::mem::replace(&mut current, chunk(n)));
                size = 0;
            }
            size += module.size();
            current.modules.push(module);
        }

        chunks.push(current);
    }

    chunks
}

/// Chunk labels per parent, in chunk order.
pub fn grouping_map(chunks: &[ModuleGroup]) -> GroupingMap {
    let mut map = GroupingMap::new();
    for chunk in chunks {
        map.entry(chunk.parent.clone())
            .or_default()
            .push(chunk.label.clone());
    }
    map
}

/// `groups` stage step factoring all modules of a multi-entry bundle. The
/// resulting grouping is published into `grouping` before any chunk leaves
/// the step.
pub fn factor(limit: usize, grouping: Arc<Mutex<GroupingMap>>) -> impl Step {
    from_fn("factor", move |input| {
        stream::once(async move {
            let modules = collect_modules(input.try_collect().await?);

            let count = modules.len();
            let chunks = group_by_size(group_by_factor(modules)?, limit);
            tracing::debug!("Factored {count} modules into {} chunks", chunks.len());

            *grouping.lock().unwrap_or_else(PoisonError::into_inner) = grouping_map(&chunks);

            Ok::<_, PipelineError>(stream::iter(
                chunks.into_iter().map(|chunk| Ok(Packet::Group(chunk))),
            ))
        })
        .try_flatten()
        .boxed()
    })
}

/// `groups` stage step putting every module into one group named `label`.
pub fn single_group(label: String) -> impl Step {
    from_fn("single-group", move |input| {
        stream::once(async move {
            let mut modules = collect_modules(input.try_collect().await?);
            sort_modules(&mut modules);

            let group = ModuleGroup {
                modules,
                ..ModuleGroup::new(label.clone(), label)
            };

            Ok::<_, PipelineError>(Packet::Group(group))
        })
        .boxed()
    })
}

fn collect_modules(packets: Vec<Packet>) -> Vec<ModuleRecord> {
    packets
        .into_iter()
        .filter_map(|packet| match packet {
            Packet::Module(module) => Some(module),
            other => {
                tracing::warn!("Dropping unexpected packet before grouping: {other:?}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PacketStream;

    fn module(id: &str, file: &str, size: usize, deps: &[&str]) -> ModuleRecord {
        let mut record = ModuleRecord::new(id, file, "x".repeat(size));
        for dep in deps {
            record = record.with_dep(format!("./{dep}"), Some(*dep));
        }
        record
    }

    fn entry(id: &str, file: &str, deps: &[&str]) -> ModuleRecord {
        module(id, file, 100, deps).as_entry()
    }

    /// Deterministic pseudo-random numbers for graph generation.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: u64) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) % bound
        }
    }

    fn random_graph(seed: u64) -> Vec<ModuleRecord> {
        let mut rng = Lcg(seed);
        let count = 5 + rng.next(40) as usize;
        let entries = 1 + rng.next(4) as usize;

        (0..count)
            .map(|i| {
                let deps: Vec<String> = (0..rng.next(4))
                    .map(|_| rng.next(count as u64).to_string())
                    .filter(|dep| *dep != i.to_string())
                    .collect();
                let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                let size = 1 + rng.next(900_000) as usize;
                let record = module(&i.to_string(), &format!("src/m{i}.js"), size, &deps);
                if i < entries { record.as_entry() } else { record }
            })
            .collect()
    }

    fn all_ids(groups: &[ModuleGroup]) -> Vec<String> {
        let mut ids: Vec<_> = groups.iter().flat_map(|g| g.ids()).map(str::to_string).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_shared_module_goes_to_common() {
        let modules = vec![
            entry("1", "app/ui.js", &["3", "4"]),
            entry("2", "app/background.js", &["3", "5"]),
            module("3", "lib/shared.js", 10, &["6"]),
            module("4", "lib/ui-only.js", 10, &[]),
            module("5", "lib/bg-only.js", 10, &[]),
            module("6", "lib/deep.js", 10, &[]),
        ];

        let groups = group_by_factor(modules).unwrap();
        let by_label: BTreeMap<_, Vec<_>> = groups
            .iter()
            .map(|g| (g.label.as_str(), g.ids().collect()))
            .collect();

        assert_eq!(groups[0].label, COMMON);
        assert_eq!(by_label["common"], vec!["3", "6"]);
        assert_eq!(by_label["ui"], vec!["1", "4"]);
        assert_eq!(by_label["background"], vec!["2", "5"]);
    }

    #[test]
    fn test_unreachable_modules_go_to_common() {
        let modules = vec![entry("1", "ui.js", &[]), module("2", "orphan.js", 10, &[])];

        let groups = group_by_factor(modules).unwrap();
        assert_eq!(groups[0].ids().collect::<Vec<_>>(), vec!["2"]);
    }

    #[test]
    fn test_entry_with_only_shared_modules_gets_empty_chunk() {
        let modules = vec![
            entry("1", "a.js", &["3"]),
            entry("2", "b.js", &["3"]),
            entry("4", "c.js", &["1"]),
            module("3", "shared.js", 10, &[]),
        ];

        // `a` is reachable from `c` too, so its only module is shared.
        let groups = group_by_factor(modules).unwrap();
        let a = groups.iter().find(|g| g.label == "a").unwrap();
        assert!(a.modules.is_empty());

        let chunks = group_by_size(groups, DEFAULT_SIZE_LIMIT);
        let a: Vec<_> = chunks.iter().filter(|c| c.parent == "a").collect();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].label, "a-0");
        assert!(a[0].modules.is_empty());
    }

    #[test]
    fn test_duplicate_entry_label() {
        let modules = vec![entry("1", "app/ui.js", &[]), entry("2", "old-ui/ui.js", &[])];

        assert_eq!(
            group_by_factor(modules),
            Err(FactorError::DuplicateEntryLabel(
                "app/ui.js".into(),
                "old-ui/ui.js".into(),
                "ui".into()
            ))
        );
    }

    #[test]
    fn test_entry_named_common() {
        let modules = vec![
            entry("1", "app/common.js", &["3"]),
            entry("2", "app/ui.js", &["3"]),
            module("3", "x.js", 10, &[]),
        ];

        assert_eq!(
            group_by_factor(modules),
            Err(FactorError::ReservedEntryLabel("app/common.js".into(), "common".into()))
        );
    }

    #[test]
    fn test_missing_module() {
        let modules = vec![entry("1", "ui.js", &["9"])];
        assert_eq!(
            group_by_factor(modules),
            Err(FactorError::MissingModule("1".into(), "9".into()))
        );
    }

    #[test]
    fn test_cycles_terminate() {
        let modules = vec![
            entry("1", "ui.js", &["2"]),
            module("2", "a.js", 10, &["3"]),
            module("3", "b.js", 10, &["2"]),
        ];

        let groups = group_by_factor(modules).unwrap();
        let ui = groups.iter().find(|g| g.label == "ui").unwrap();
        assert_eq!(ui.ids().collect::<Vec<_>>(), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_three_entries_scenario() {
        let mut modules = vec![module("1", "lib/x.js", 50_000, &[])];
        let mut next = 2;

        for name in ["a", "b", "c"] {
            let entry_id = next;
            let privates: Vec<String> = (1..=10).map(|i| (entry_id + i).to_string()).collect();
            let mut deps: Vec<&str> = privates.iter().map(String::as_str).collect();
            deps.push("1");

            modules.push(entry(&entry_id.to_string(), &format!("app/{name}.js"), &deps));
            for id in &privates {
                modules.push(module(id, &format!("app/{name}/{id}.js"), 300_000, &[]));
            }
            next += 11;
        }

        let chunks = group_by_size(group_by_factor(modules).unwrap(), DEFAULT_SIZE_LIMIT);

        let common: Vec<_> = chunks.iter().filter(|c| c.is_common()).collect();
        assert_eq!(common.len(), 1);
        assert_eq!(common[0].label, "common-0");
        assert_eq!(common[0].ids().collect::<Vec<_>>(), vec!["1"]);

        for name in ["a", "b", "c"] {
            let own: Vec<_> = chunks.iter().filter(|c| c.parent == name).collect();
            assert_eq!(own.len(), 2, "{name}");
            assert_eq!(own[0].label, format!("{name}-0"));
            assert_eq!(own[1].label, format!("{name}-1"));
            assert_eq!(own.iter().map(|c| c.modules.len()).sum::<usize>(), 11);
            assert!(own.iter().all(|c| c.size() <= DEFAULT_SIZE_LIMIT));
        }
    }

    #[test]
    fn test_oversized_module_is_singleton() {
        let groups = vec![ModuleGroup {
            label: "ui".into(),
            parent: "ui".into(),
            modules: vec![
                module("1", "a.js", 10, &[]),
                module("2", "huge.js", 5_000, &[]),
                module("3", "b.js", 10, &[]),
            ],
        }];

        let chunks = group_by_size(groups, 1_000);
        let ids: Vec<Vec<_>> = chunks.iter().map(|c| c.ids().collect()).collect();
        assert_eq!(ids, vec![vec!["1"], vec!["2"], vec!["3"]]);
    }

    #[test]
    fn test_common_is_never_split() {
        let groups = vec![ModuleGroup {
            label: COMMON.into(),
            parent: COMMON.into(),
            modules: vec![module("1", "a.js", 800, &[]), module("2", "b.js", 800, &[])],
        }];

        let chunks = group_by_size(groups, 1_000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size(), 1_600);
    }

    #[test]
    fn test_ids_sort_numerically() {
        let modules = vec![
            entry("10", "ui.js", &["9", "100"]),
            module("9", "a.js", 1, &[]),
            module("100", "b.js", 1, &[]),
        ];

        let groups = group_by_factor(modules).unwrap();
        let ui = groups.iter().find(|g| g.label == "ui").unwrap();
        assert_eq!(ui.ids().collect::<Vec<_>>(), vec!["9", "10", "100"]);
    }

    #[test]
    fn test_partition_properties_on_generated_graphs() {
        let limit = 2_000_000;

        for seed in 0..200 {
            let modules = random_graph(seed);
            let mut expected: Vec<_> = modules.iter().map(|m| m.id.clone()).collect();
            expected.sort();

            let factored = group_by_factor(modules.clone()).unwrap();
            let chunks = group_by_size(factored.clone(), limit);

            // Every module lands in exactly one chunk.
            assert_eq!(all_ids(&chunks), expected, "seed {seed}");

            for module in &modules {
                let owners = chunks.iter().filter(|c| c.ids().any(|id| id == module.id)).count();
                assert_eq!(owners, 1, "seed {seed}");
            }

            // The ceiling holds unless a chunk is a single module.
            for chunk in chunks.iter().filter(|c| !c.is_common()) {
                assert!(chunk.size() <= limit || chunk.modules.len() == 1, "seed {seed}");
            }

            // Same input, same output.
            let again = group_by_size(group_by_factor(modules).unwrap(), limit);
            assert_eq!(again, chunks, "seed {seed}");
        }
    }

    #[test]
    fn test_common_extraction_on_generated_graphs() {
        for seed in 0..200 {
            let modules = random_graph(seed);
            let groups = group_by_factor(modules.clone()).unwrap();

            let owner = |id: &str| {
                groups
                    .iter()
                    .find(|g| g.ids().any(|m| m == id))
                    .map(|g| g.label.clone())
                    .unwrap()
            };

            // Recompute reachability naively, by label.
            let by_id: HashMap<&str, &ModuleRecord> =
                modules.iter().map(|m| (m.id.as_str(), m)).collect();
            let mut reach: HashMap<&str, BTreeSet<&str>> = HashMap::new();

            for entry in modules.iter().filter(|m| m.entry) {
                let mut stack = vec![entry.id.as_str()];
                let mut seen = BTreeSet::new();
                while let Some(id) = stack.pop() {
                    if !seen.insert(id) {
                        continue;
                    }
                    reach.entry(id).or_default().insert(entry.label());
                    stack.extend(by_id[id].dep_ids());
                }
            }

            for module in &modules {
                let labels = reach.get(module.id.as_str()).cloned().unwrap_or_default();
                let expected = match labels.len() {
                    1 => labels.first().unwrap().to_string(),
                    _ => COMMON.to_string(),
                };
                assert_eq!(owner(&module.id), expected, "seed {seed} module {}", module.id);
            }
        }
    }

    #[tokio::test]
    async fn test_factor_step_publishes_grouping() {
        let grouping = Arc::new(Mutex::new(GroupingMap::new()));
        let modules = vec![
            entry("1", "app/ui.js", &["3"]),
            entry("2", "app/background.js", &["3"]),
            module("3", "lib/shared.js", 10, &[]),
        ];

        let input: PacketStream =
            stream::iter(modules.into_iter().map(|m| Ok(Packet::Module(m)))).boxed();
        let out: Vec<_> = Box::new(factor(1_000, grouping.clone()))
            .apply(input)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(out.len(), 3);

        let grouping = grouping.lock().unwrap();
        assert_eq!(grouping["common"], vec!["common-0"]);
        assert_eq!(grouping["ui"], vec!["ui-0"]);
        assert_eq!(grouping["background"], vec!["background-0"]);
    }

    #[tokio::test]
    async fn test_factor_step_reports_errors() {
        let grouping = Arc::new(Mutex::new(GroupingMap::new()));
        let input: PacketStream = stream::iter(vec![Ok(Packet::Module(entry("1", "ui.js", &["2"])))]).boxed();

        let result: Result<Vec<_>, _> = Box::new(factor(1_000, grouping))
            .apply(input)
            .try_collect()
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::Factor(FactorError::MissingModule(..)))
        ));
    }

    #[tokio::test]
    async fn test_single_group() {
        let input: PacketStream = stream::iter(vec![
            Ok(Packet::Module(module("2", "b.js", 1, &[]))),
            Ok(Packet::Module(entry("1", "contentscript.js", &["2"]))),
        ])
        .boxed();

        let out: Vec<_> = Box::new(single_group("contentscript".into()))
            .apply(input)
            .try_collect()
            .await
            .unwrap();

        let [Packet::Group(group)] = out.as_slice() else {
            panic!("expected one group");
        };
        assert_eq!(group.label, "contentscript");
        assert_eq!(group.ids().collect::<Vec<_>>(), vec!["1", "2"]);
    }
}
