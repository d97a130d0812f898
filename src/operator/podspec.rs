//! Pod construction for warm pools.
//!
//! Every pool pod carries two containers: `executor` (the user image,
//! running the executor agent) and `sidecar` (the RPC bridge), sharing a
//! workspace volume, the tools tree, and the IPC socket directory. Tool
//! sources are staged by init containers before the main containers start.

use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
    EnvVar, HTTPGetAction, KeyToPath, NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm,
    Pod, PodSpec, PreferredSchedulingTerm, Probe, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::config::Settings;
use crate::crd::{
    ResourceSpec, ToolSource, WarmPool, POD_STATE_LABEL, POD_STATE_READY, POOL_LABEL, TOOLS_DIR,
};
use crate::error::{Error, Result};

const WORKSPACE_VOLUME: &str = "workspace";
const TOOLS_VOLUME: &str = "tools";
const IPC_VOLUME: &str = "ipc";
const IPC_DIR: &str = "/var/run/arl";

/// Name of the ConfigMap holding a pool's inline tool files.
pub fn tools_configmap_name(pool_name: &str) -> String {
    format!("{pool_name}-tools")
}

pub fn pod_labels(pool_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(POOL_LABEL.to_string(), pool_name.to_string());
    labels.insert(POD_STATE_LABEL.to_string(), POD_STATE_READY.to_string());
    labels
}

/// Content of the generated `/opt/arl/tools/registry.json`.
pub fn registry_json(tools: &[ToolSource]) -> String {
    let entries: Vec<serde_json::Value> = tools
        .iter()
        .map(|tool| {
            let source = if tool.image.is_some() {
                "image"
            } else if tool.config_map.is_some() {
                "configMap"
            } else {
                "inline"
            };
            serde_json::json!({ "name": tool.name, "source": source })
        })
        .collect();
    serde_json::json!({ "tools": entries }).to_string()
}

/// ConfigMap for inline tool definitions, when the pool has any. Keys are
/// flattened `<tool>-<file>`; the volume's item paths restore the tree.
pub fn inline_tools_configmap(pool: &WarmPool) -> Option<ConfigMap> {
    let mut data = BTreeMap::new();
    for tool in &pool.spec.tools {
        if let Some(inline) = &tool.inline {
            for (file, contents) in inline {
                data.insert(format!("{}-{}", tool.name, file), contents.clone());
            }
        }
    }
    if data.is_empty() {
        return None;
    }
    let owner = pool.controller_owner_ref(&())?;
    Some(ConfigMap {
        metadata: ObjectMeta {
            name: Some(tools_configmap_name(&pool.name_any())),
            namespace: pool.namespace(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

fn quantity_map(resources: &ResourceSpec) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &resources.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &resources.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Init containers staging the tool trees plus the registry file.
fn tool_init_containers(pool: &WarmPool, sidecar_image: &str) -> (Vec<Container>, Vec<Volume>) {
    let mut containers = Vec::new();
    let mut volumes = Vec::new();
    let tools_mount = mount(TOOLS_VOLUME, TOOLS_DIR);

    let mut inline_items: Vec<KeyToPath> = Vec::new();
    for tool in &pool.spec.tools {
        if let Some(image) = &tool.image {
            // Tool images carry their payload under /tools by convention.
            containers.push(Container {
                name: format!("tool-{}", tool.name),
                image: Some(image.clone()),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!(
                        "mkdir -p {TOOLS_DIR}/{name} && cp -a /tools/. {TOOLS_DIR}/{name}/",
                        name = tool.name
                    ),
                ]),
                volume_mounts: Some(vec![tools_mount.clone()]),
                ..Default::default()
            });
        }
        if let Some(config_map) = &tool.config_map {
            let volume_name = format!("tool-cm-{}", tool.name);
            volumes.push(Volume {
                name: volume_name.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_map.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            containers.push(Container {
                name: format!("tool-{}", tool.name),
                image: Some(sidecar_image.to_string()),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!(
                        "mkdir -p {TOOLS_DIR}/{name} && cp -a /tool-src/. {TOOLS_DIR}/{name}/",
                        name = tool.name
                    ),
                ]),
                volume_mounts: Some(vec![
                    tools_mount.clone(),
                    mount(&volume_name, "/tool-src"),
                ]),
                ..Default::default()
            });
        }
        if let Some(inline) = &tool.inline {
            for file in inline.keys() {
                inline_items.push(KeyToPath {
                    key: format!("{}-{}", tool.name, file),
                    path: format!("{}/{}", tool.name, file),
                    ..Default::default()
                });
            }
        }
    }

    if !inline_items.is_empty() {
        volumes.push(Volume {
            name: "tools-inline".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: tools_configmap_name(&pool.name_any()),
                items: Some(inline_items),
                ..Default::default()
            }),
            ..Default::default()
        });
        containers.push(Container {
            name: "tools-inline".to_string(),
            image: Some(sidecar_image.to_string()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("cp -a /tools-inline/. {TOOLS_DIR}/"),
            ]),
            volume_mounts: Some(vec![
                tools_mount.clone(),
                mount("tools-inline", "/tools-inline"),
            ]),
            ..Default::default()
        });
    }

    if !pool.spec.tools.is_empty() {
        let registry = registry_json(&pool.spec.tools);
        containers.push(Container {
            name: "tools-registry".to_string(),
            image: Some(sidecar_image.to_string()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("printf '%s' '{registry}' > {TOOLS_DIR}/registry.json"),
            ]),
            volume_mounts: Some(vec![tools_mount]),
            ..Default::default()
        });
    }

    (containers, volumes)
}

/// Preferred node affinity concentrating pods on warm-image nodes.
fn locality_affinity(weight: i32, nodes: &[String]) -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                PreferredSchedulingTerm {
                    weight,
                    preference: NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: "kubernetes.io/hostname".to_string(),
                            operator: "In".to_string(),
                            values: Some(nodes.to_vec()),
                        }]),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build one warm pod for the pool. `locality_nodes` is the (possibly
/// empty) set of nodes that already hold the executor image; empty means no
/// affinity at all.
pub fn build_pod(pool: &WarmPool, settings: &Settings, locality_nodes: &[String]) -> Result<Pod> {
    let pool_name = pool.name_any();
    let owner = pool
        .controller_owner_ref(&())
        .ok_or_else(|| Error::Upstream(format!("pool {pool_name} has no uid yet")))?;
    let template = &pool.spec.template;
    let workspace_dir = template
        .workspace_dir
        .clone()
        .unwrap_or_else(|| settings.workspace_dir.clone());
    let sidecar_image = template
        .sidecar_image
        .clone()
        .unwrap_or_else(|| settings.arl_image.clone());
    let agent_socket = format!("{IPC_DIR}/agent.sock");

    let shared_mounts = vec![
        mount(WORKSPACE_VOLUME, &workspace_dir),
        mount(TOOLS_VOLUME, TOOLS_DIR),
        mount(IPC_VOLUME, IPC_DIR),
    ];

    let mut executor_env = vec![EnvVar {
        name: "AGENT_SOCKET".to_string(),
        value: Some(agent_socket.clone()),
        ..Default::default()
    }];
    if let Some(env) = &template.env {
        for (name, value) in env {
            executor_env.push(EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            });
        }
    }

    let resources = template.resources.as_ref().map(|spec| {
        let quantities = quantity_map(spec);
        ResourceRequirements {
            requests: Some(quantities.clone()),
            limits: Some(quantities),
            ..Default::default()
        }
    });

    let executor = Container {
        name: "executor".to_string(),
        image: Some(template.image.clone()),
        command: Some(vec!["executor-agent".to_string()]),
        env: Some(executor_env),
        working_dir: Some(workspace_dir.clone()),
        resources,
        volume_mounts: Some(shared_mounts.clone()),
        ..Default::default()
    };

    let sidecar = Container {
        name: "sidecar".to_string(),
        image: Some(sidecar_image.clone()),
        command: Some(vec!["arl".to_string(), "sidecar".to_string()]),
        env: Some(vec![
            EnvVar {
                name: "SIDECAR_GRPC_PORT".to_string(),
                value: Some(settings.sidecar_rpc_port.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "SIDECAR_HEALTH_PORT".to_string(),
                value: Some(settings.sidecar_health_port.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "AGENT_SOCKET".to_string(),
                value: Some(agent_socket),
                ..Default::default()
            },
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("rpc".to_string()),
                container_port: settings.sidecar_rpc_port as i32,
                ..Default::default()
            },
            ContainerPort {
                name: Some("health".to_string()),
                container_port: settings.sidecar_health_port as i32,
                ..Default::default()
            },
        ]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/readyz".to_string()),
                port: IntOrString::Int(settings.sidecar_health_port as i32),
                ..Default::default()
            }),
            period_seconds: Some(2),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        volume_mounts: Some(shared_mounts),
        ..Default::default()
    };

    let (init_containers, mut tool_volumes) = tool_init_containers(pool, &sidecar_image);
    let mut volumes = vec![
        empty_dir(WORKSPACE_VOLUME),
        empty_dir(TOOLS_VOLUME),
        empty_dir(IPC_VOLUME),
    ];
    volumes.append(&mut tool_volumes);

    let affinity = pool
        .spec
        .image_locality
        .as_ref()
        .filter(|locality| locality.enabled && !locality_nodes.is_empty())
        .map(|locality| locality_affinity(locality.clamped_weight(), locality_nodes));

    Ok(Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{pool_name}-")),
            namespace: pool.namespace(),
            labels: Some(pod_labels(&pool_name)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            init_containers: if init_containers.is_empty() {
                None
            } else {
                Some(init_containers)
            },
            containers: vec![executor, sidecar],
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            automount_service_account_token: Some(false),
            affinity,
            ..Default::default()
        }),
        ..Default::default()
    })
}
