//! Binding runtime values into a workflow graph.
//!
//! Callers hand over a [`Graph`] and an [`OverrideSet`] and get back a
//! [`JobBundle`] ready for transport, without knowing which node IDs the
//! workflow author used:
//!
//! - images go to `LoadImage` nodes positionally, lowest numeric ID first;
//! - the prompt goes to every text-encoder node whose role allows it
//!   (`CLIPTextEncode` only when its ID is [`POSITIVE_PROMPT_NODE_ID`]);
//! - every input literally named `seed` gets a fresh random value.
//!
//! Nothing here is fatal. Surplus images, missing loader nodes, and
//! prompts with nowhere to go are logged as warnings and reported in the
//! returned [`InjectionReport`].
//!
//! [`POSITIVE_PROMPT_NODE_ID`]: crate::graph::POSITIVE_PROMPT_NODE_ID

use indexmap::IndexMap;
use rand::Rng;
use serde_json::Value;

use crate::envelope::JobBundle;
use crate::graph::{Graph, NodeRole};

/// Smallest seed value drawn.
pub const SEED_MIN: u64 = 1;

/// Largest seed value drawn (10^15).
pub const SEED_MAX: u64 = 1_000_000_000_000_000;

/// Name of the input randomized on every node that declares it.
pub const SEED_INPUT: &str = "seed";

/// One image supplied by the submitting side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    /// Logical filename, as the execution engine will see it.
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SeedPolicy {
    /// Overwrite every `seed` input with a fresh random value.
    #[default]
    RandomizeIfPresent,
    /// Leave seeds as authored.
    Preserve,
}

/// Runtime intent for one submission.
#[derive(Debug, Clone, Default)]
pub struct OverrideSet {
    /// Images in the order they should be bound.
    pub images: Vec<ImageInput>,
    pub prompt: Option<String>,
    pub seed_policy: SeedPolicy,
}

/// One `(node, filename)` pairing made by positional image binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBinding {
    pub node_id: String,
    pub filename: String,
}

/// What [`inject`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InjectionReport {
    pub image_bindings: Vec<ImageBinding>,
    /// Filenames of images that found no loader node.
    pub dropped_images: Vec<String>,
    /// Nodes whose text parameter received the prompt.
    pub prompt_nodes: Vec<String>,
    /// Nodes whose `seed` input was replaced.
    pub seeded_nodes: Vec<String>,
}

/// Bind `overrides` into `graph` and package the result for transport.
///
/// Only images that were bound to a loader node are carried in the
/// bundle's auxiliary files.
pub fn inject(mut graph: Graph, mut overrides: OverrideSet) -> (JobBundle, InjectionReport) {
    let mut report = InjectionReport::default();
    let mut files = IndexMap::new();

    disambiguate_filenames(&mut overrides.images);
    let filenames: Vec<String> = overrides.images.iter().map(|i| i.filename.clone()).collect();
    let bindings = bind_images_positionally(&mut graph, &filenames);

    if !overrides.images.is_empty() && bindings.is_empty() {
        tracing::warn!(
            images = overrides.images.len(),
            "Images supplied but the workflow has no LoadImage node; all images dropped",
        );
    }

    let mut images = overrides.images.into_iter();
    for _ in &bindings {
        if let Some(image) = images.next() {
            files.insert(image.filename, image.bytes);
        }
    }
    for surplus in images {
        if !bindings.is_empty() {
            tracing::warn!(
                filename = %surplus.filename,
                "More images than LoadImage nodes; dropping image",
            );
        }
        report.dropped_images.push(surplus.filename);
    }
    report.image_bindings = bindings;

    report.prompt_nodes = bind_prompt(&mut graph, overrides.prompt.as_deref());
    if overrides.seed_policy == SeedPolicy::RandomizeIfPresent {
        report.seeded_nodes = randomize_seeds(&mut graph);
    }

    (
        JobBundle {
            workflow: graph,
            images: files,
        },
        report,
    )
}

/// Rename later images whose filename repeats an earlier one
/// (`x.png`, `x.png` becomes `x.png`, `x_2.png`), so every image keeps its
/// own bytes in the bundle.
fn disambiguate_filenames(images: &mut [ImageInput]) {
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    for image in images.iter_mut() {
        if seen.insert(image.filename.clone()) {
            continue;
        }
        let (stem, ext) = match image.filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
            _ => (image.filename.clone(), String::new()),
        };
        let mut n = 2;
        let renamed = loop {
            let candidate = format!("{stem}_{n}{ext}");
            if !seen.contains(&candidate) {
                break candidate;
            }
            n += 1;
        };
        tracing::warn!(
            filename = %image.filename,
            renamed = %renamed,
            "Duplicate image filename; renaming",
        );
        image.filename = renamed.clone();
        seen.insert(renamed);
    }
}

/// Point image-loader nodes at `filenames`, positionally.
///
/// Loader nodes are visited in ascending numeric ID order and zipped with
/// `filenames`; the first file goes to the lowest ID. Surplus filenames
/// and surplus loader nodes are left alone. Used both by [`inject`] on
/// the submitting side and by the worker for clients that did not inject.
pub fn bind_images_positionally(graph: &mut Graph, filenames: &[String]) -> Vec<ImageBinding> {
    let mut bindings = Vec::new();

    for (node_id, filename) in graph.image_loader_ids().into_iter().zip(filenames) {
        let Some(node) = graph.get(&node_id) else {
            continue;
        };
        let NodeRole::ImageLoader { image_param } = node.class_type.role() else {
            continue;
        };
        if graph
            .set_input(&node_id, image_param, Value::String(filename.clone()))
            .is_ok()
        {
            tracing::info!(node_id = %node_id, filename = %filename, "Bound image to loader node");
            bindings.push(ImageBinding {
                node_id,
                filename: filename.clone(),
            });
        }
    }

    bindings
}

/// Overwrite the text parameter of every prompt-capable node.
///
/// Returns the IDs of the nodes that were changed.
fn bind_prompt(graph: &mut Graph, prompt: Option<&str>) -> Vec<String> {
    let Some(prompt) = prompt else {
        return Vec::new();
    };

    let mut changed = Vec::new();
    for (node_id, node) in graph.iter_mut() {
        match node.class_type.role() {
            NodeRole::TextEncoder {
                text_param,
                required_id,
            } => {
                if required_id.is_some_and(|required| required != node_id) {
                    tracing::debug!(
                        node_id,
                        kind = %node.class_type,
                        "Skipping text encoder that is not the positive prompt node",
                    );
                    continue;
                }
                node.inputs
                    .insert(text_param.to_string(), Value::String(prompt.to_string()));
                tracing::info!(node_id, kind = %node.class_type, "Injected prompt");
                changed.push(node_id.to_string());
            }
            NodeRole::ImageLoader { .. } | NodeRole::Passthrough => {}
        }
    }

    if changed.is_empty() {
        tracing::warn!("Prompt supplied but no prompt-capable node found");
    }
    changed
}

/// Replace every `seed` input with a value drawn from `[SEED_MIN, SEED_MAX]`.
fn randomize_seeds(graph: &mut Graph) -> Vec<String> {
    let mut rng = rand::rng();
    let mut seeded = Vec::new();

    for (node_id, node) in graph.iter_mut() {
        if let Some(seed) = node.inputs.get_mut(SEED_INPUT) {
            let value = rng.random_range(SEED_MIN..=SEED_MAX);
            *seed = Value::from(value);
            tracing::info!(node_id, seed = value, "Randomized seed");
            seeded.push(node_id.to_string());
        }
    }

    seeded
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn image(name: &str) -> ImageInput {
        ImageInput {
            filename: name.to_string(),
            bytes: name.as_bytes().to_vec(),
        }
    }

    fn workflow() -> Graph {
        Graph::from_json(&json!({
            "12": { "class_type": "LoadImage", "inputs": { "image": "placeholder.png" } },
            "5": { "class_type": "LoadImage", "inputs": { "image": "placeholder.png" } },
            "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "old", "clip": ["4", 1] } },
            "7": { "class_type": "CLIPTextEncode", "inputs": { "text": "blurry", "clip": ["4", 1] } },
            "3": { "class_type": "KSampler", "inputs": { "seed": 42, "steps": 20 } },
            "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "out" } }
        }))
        .unwrap()
    }

    #[test]
    fn images_bind_to_lowest_numeric_ids_in_order() {
        let overrides = OverrideSet {
            images: vec![image("a.png"), image("b.png")],
            ..Default::default()
        };
        let (bundle, report) = inject(workflow(), overrides);

        assert_eq!(bundle.workflow.get("5").unwrap().input("image"), Some(&json!("a.png")));
        assert_eq!(bundle.workflow.get("12").unwrap().input("image"), Some(&json!("b.png")));
        assert_eq!(bundle.images.keys().collect::<Vec<_>>(), vec!["a.png", "b.png"]);
        assert_eq!(bundle.images["a.png"], b"a.png".to_vec());
        assert!(report.dropped_images.is_empty());
    }

    #[test]
    fn repeated_filenames_keep_each_image() {
        let overrides = OverrideSet {
            images: vec![
                ImageInput { filename: "x.png".into(), bytes: b"FIRST".to_vec() },
                ImageInput { filename: "x.png".into(), bytes: b"SECOND".to_vec() },
            ],
            ..Default::default()
        };
        let (bundle, report) = inject(workflow(), overrides);

        assert_eq!(bundle.images.len(), 2);
        assert_eq!(bundle.workflow.get("5").unwrap().input("image"), Some(&json!("x.png")));
        assert_eq!(bundle.workflow.get("12").unwrap().input("image"), Some(&json!("x_2.png")));
        assert_eq!(bundle.images["x.png"], b"FIRST".to_vec());
        assert_eq!(bundle.images["x_2.png"], b"SECOND".to_vec());
        assert_eq!(report.image_bindings.len(), 2);
    }

    #[test]
    fn renaming_skips_names_already_taken() {
        let mut images = vec![image("x.png"), image("x_2.png"), image("x.png"), image("noext")];
        images.push(image("noext"));
        disambiguate_filenames(&mut images);
        let names: Vec<_> = images.iter().map(|i| i.filename.as_str()).collect();
        assert_eq!(names, vec!["x.png", "x_2.png", "x_3.png", "noext", "noext_2"]);
    }

    #[test]
    fn surplus_images_are_dropped() {
        let mut graph = Graph::new();
        graph.insert(
            "1",
            crate::graph::Node::new(crate::graph::NodeKind::LoadImage).with_input("image", "x"),
        );
        let overrides = OverrideSet {
            images: vec![image("a.png"), image("b.png"), image("c.png")],
            ..Default::default()
        };
        let (bundle, report) = inject(graph, overrides);

        assert_eq!(report.image_bindings.len(), 1);
        assert_eq!(report.dropped_images, vec!["b.png", "c.png"]);
        assert_eq!(bundle.images.len(), 1);
        assert_eq!(bundle.workflow.get("1").unwrap().input("image"), Some(&json!("a.png")));
    }

    #[test]
    fn fewer_images_leave_higher_loaders_untouched() {
        let overrides = OverrideSet {
            images: vec![image("only.png")],
            ..Default::default()
        };
        let (bundle, _) = inject(workflow(), overrides);
        assert_eq!(bundle.workflow.get("5").unwrap().input("image"), Some(&json!("only.png")));
        assert_eq!(
            bundle.workflow.get("12").unwrap().input("image"),
            Some(&json!("placeholder.png"))
        );
    }

    #[test]
    fn binding_count_is_min_of_loaders_and_images() {
        for loaders in 0..4usize {
            for images in 0..4usize {
                let mut graph = Graph::new();
                for i in 0..loaders {
                    graph.insert(
                        format!("{}", 100 - i * 10),
                        crate::graph::Node::new(crate::graph::NodeKind::LoadImage),
                    );
                }
                let overrides = OverrideSet {
                    images: (0..images).map(|i| image(&format!("{i}.png"))).collect(),
                    ..Default::default()
                };
                let (_, report) = inject(graph, overrides);
                assert_eq!(report.image_bindings.len(), loaders.min(images));
                let mut expected_ids: Vec<String> =
                    (0..loaders).map(|i| format!("{}", 100 - i * 10)).collect();
                expected_ids.sort_by(|a, b| crate::graph::compare_node_ids(a, b));
                let bound_ids: Vec<String> =
                    report.image_bindings.iter().map(|b| b.node_id.clone()).collect();
                assert_eq!(bound_ids, expected_ids[..loaders.min(images)].to_vec());
            }
        }
    }

    #[test]
    fn prompt_only_reaches_positive_clip_node() {
        let overrides = OverrideSet {
            prompt: Some("a lighthouse at dusk".to_string()),
            ..Default::default()
        };
        let (bundle, report) = inject(workflow(), overrides);
        assert_eq!(
            bundle.workflow.get("6").unwrap().input("text"),
            Some(&json!("a lighthouse at dusk"))
        );
        assert_eq!(bundle.workflow.get("7").unwrap().input("text"), Some(&json!("blurry")));
        assert_eq!(report.prompt_nodes, vec!["6"]);
    }

    #[test]
    fn qwen_encoders_take_prompt_regardless_of_id() {
        let graph = Graph::from_json(&json!({
            "21": { "class_type": "TextEncodeQwenImageEditPlus", "inputs": { "prompt": "" } },
            "40": { "class_type": "TextEncodeQwenImageEdit", "inputs": { "prompt": "" } }
        }))
        .unwrap();
        let overrides = OverrideSet {
            prompt: Some("make it snow".to_string()),
            ..Default::default()
        };
        let (bundle, report) = inject(graph, overrides);
        assert_eq!(report.prompt_nodes, vec!["21", "40"]);
        assert_eq!(
            bundle.workflow.get("40").unwrap().input("prompt"),
            Some(&json!("make it snow"))
        );
    }

    #[test]
    fn seeds_are_randomized_without_prompt() {
        let (first, report) = inject(workflow(), OverrideSet::default());
        let (second, _) = inject(workflow(), OverrideSet::default());

        assert_eq!(report.seeded_nodes, vec!["3"]);
        let a = first.workflow.get("3").unwrap().input("seed").unwrap().as_u64().unwrap();
        let b = second.workflow.get("3").unwrap().input("seed").unwrap().as_u64().unwrap();
        assert!((SEED_MIN..=SEED_MAX).contains(&a));
        assert!((SEED_MIN..=SEED_MAX).contains(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn preserve_policy_keeps_seeds() {
        let overrides = OverrideSet {
            seed_policy: SeedPolicy::Preserve,
            ..Default::default()
        };
        let (bundle, report) = inject(workflow(), overrides);
        assert!(report.seeded_nodes.is_empty());
        assert_eq!(bundle.workflow.get("3").unwrap().input("seed"), Some(&json!(42)));
    }

    #[test]
    fn images_without_loader_are_all_dropped() {
        let graph = Graph::from_json(&json!({
            "1": { "class_type": "EmptyLatentImage", "inputs": {} }
        }))
        .unwrap();
        let overrides = OverrideSet {
            images: vec![image("a.png")],
            ..Default::default()
        };
        let (bundle, report) = inject(graph, overrides);
        assert!(bundle.images.is_empty());
        assert_eq!(report.dropped_images, vec!["a.png"]);
    }
}
