use serde_json::Value;

/// Where container arrays live in pods, pod templates and job templates,
/// in the order they are reported.
pub const CONTAINER_PATHS: &[&[&str]] = &[
    &["spec", "initContainers"],
    &["spec", "containers"],
    &["spec", "ephemeralContainers"],
    &["spec", "template", "spec", "initContainers"],
    &["spec", "template", "spec", "containers"],
    &["spec", "jobTemplate", "spec", "template", "spec", "initContainers"],
    &["spec", "jobTemplate", "spec", "template", "spec", "containers"],
];

/// The pod spec shapes that carry `serviceAccountName` and
/// `imagePullSecrets`.
const POD_SPEC_PATHS: [&[&str]; 3] = [
    &["spec"],
    &["spec", "template", "spec"],
    &["spec", "jobTemplate", "spec", "template", "spec"],
];

/// One container found in an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSpec {
    /// JSONPath of the container, e.g. `{.spec.template.spec.containers[0]}`.
    pub locator: String,
    pub name:    String,
    pub image:   String,
}

fn lookup<'a>(object: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(object, |value, key| value.get(*key))
}

/// Every container under `paths`, walking paths and then array elements in
/// order. Elements without a string `name` and `image` are skipped.
pub(crate) fn container_specs(object: &Value, paths: &[&[&str]]) -> Vec<ContainerSpec> {
    let mut specs = Vec::new();
    for path in paths {
        let Some(containers) = lookup(object, path).and_then(Value::as_array) else {
            continue;
        };
        for (i, container) in containers.iter().enumerate() {
            let name = container.get("name").and_then(Value::as_str);
            let image = container.get("image").and_then(Value::as_str);
            if let (Some(name), Some(image)) = (name, image) {
                specs.push(ContainerSpec {
                    locator: format!("{{.{}[{i}]}}", path.join(".")),
                    name:    name.to_owned(),
                    image:   image.to_owned(),
                });
            }
        }
    }
    specs
}

/// Pull secret names from every pod spec shape, accumulated in order.
pub(crate) fn image_pull_secrets(object: &Value) -> Vec<String> {
    POD_SPEC_PATHS
        .iter()
        .filter_map(|path| lookup(object, path)?.get("imagePullSecrets")?.as_array())
        .flatten()
        .filter_map(|secret| secret.get("name").and_then(Value::as_str))
        .map(str::to_owned)
        .collect()
}

/// The first non-empty `serviceAccountName` across the pod spec shapes.
pub(crate) fn service_account_name(object: &Value) -> Option<String> {
    POD_SPEC_PATHS
        .iter()
        .filter_map(|path| lookup(object, path)?.get("serviceAccountName")?.as_str())
        .find(|name| !name.is_empty())
        .map(str::to_owned)
}
