//! Cluster capacity accounting

use std::fmt;

use k8s_openapi::api::core::v1::{Node, PersistentVolume, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::{Error, Result};

/// Kind of cluster, decides where disk capacity is read from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterType {
    Eks,
    Minikube,
    Generic,
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterType::Eks => f.write_str("eks"),
            ClusterType::Minikube => f.write_str("minikube"),
            ClusterType::Generic => f.write_str("generic"),
        }
    }
}

/// CPU, memory and disk of a cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Resources {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

impl Resources {
    /// Component-wise subtraction clamped at zero
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            disk_bytes: self.disk_bytes.saturating_sub(other.disk_bytes),
        }
    }
}

/// Guess the cluster type from node labels and provider ids
pub fn detect_cluster_type(nodes: &[Node]) -> ClusterType {
    let eks = nodes.iter().any(|node| {
        let provider_aws = node
            .spec
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .map_or(false, |id| id.starts_with("aws://"));
        let eks_label = node
            .metadata
            .labels
            .as_ref()
            .map_or(false, |labels| labels.keys().any(|k| k.starts_with("eks.amazonaws.com/")));
        provider_aws || eks_label
    });
    if eks {
        return ClusterType::Eks;
    }

    let minikube = nodes.iter().any(|node| {
        node.metadata.name.as_deref() == Some("minikube")
            || node
                .metadata
                .labels
                .as_ref()
                .map_or(false, |labels| labels.contains_key("minikube.k8s.io/name"))
    });
    if minikube {
        ClusterType::Minikube
    } else {
        ClusterType::Generic
    }
}

/// Allocatable capacity of all nodes.
///
/// Disk is the capacity of persistent volumes on EKS and node ephemeral
/// storage everywhere else.
pub fn all_resources(
    cluster_type: ClusterType,
    nodes: &[Node],
    volumes: &[PersistentVolume],
) -> Result<Resources> {
    let mut total = Resources::default();

    for node in nodes {
        let Some(allocatable) = node.status.as_ref().and_then(|s| s.allocatable.as_ref()) else {
            continue;
        };
        if let Some(cpu) = allocatable.get("cpu") {
            total.cpu_millis += str_to_millis(&cpu.0)?;
        }
        if let Some(memory) = allocatable.get("memory") {
            total.memory_bytes += str_to_bytes(&memory.0)?;
        }
        if cluster_type != ClusterType::Eks {
            if let Some(disk) = allocatable.get("ephemeral-storage") {
                total.disk_bytes += str_to_bytes(&disk.0)?;
            }
        }
    }

    if cluster_type == ClusterType::Eks {
        for volume in volumes {
            total.disk_bytes += volume_capacity(volume)?;
        }
    }

    Ok(total)
}

/// Requests of every pod that still runs, plus claimed disk
pub fn consumed_resources(
    cluster_type: ClusterType,
    pods: &[Pod],
    volumes: &[PersistentVolume],
) -> Result<Resources> {
    let mut consumed = Resources::default();

    for pod in pods.iter().filter(|p| !is_terminated(p)) {
        let Some(spec) = &pod.spec else { continue };
        for container in &spec.containers {
            let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) else {
                continue;
            };
            if let Some(cpu) = requests.get("cpu") {
                consumed.cpu_millis += str_to_millis(&cpu.0)?;
            }
            if let Some(memory) = requests.get("memory") {
                consumed.memory_bytes += str_to_bytes(&memory.0)?;
            }
            if cluster_type != ClusterType::Eks {
                if let Some(disk) = requests.get("ephemeral-storage") {
                    consumed.disk_bytes += str_to_bytes(&disk.0)?;
                }
            }
        }
    }

    if cluster_type == ClusterType::Eks {
        for volume in volumes.iter().filter(|v| is_bound(v)) {
            consumed.disk_bytes += volume_capacity(volume)?;
        }
    }

    Ok(consumed)
}

fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn is_bound(volume: &PersistentVolume) -> bool {
    volume.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound")
}

fn volume_capacity(volume: &PersistentVolume) -> Result<u64> {
    volume
        .spec
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
        .map(|q: &Quantity| str_to_bytes(&q.0))
        .unwrap_or(Ok(0))
}

/// Convert a Kubernetes quantity to bytes, rounding up.
///
/// `"0.3Gi"` is 322122548.
pub fn str_to_bytes(quantity: &str) -> Result<u64> {
    let value = parse_quantity(quantity)?;
    Ok(value.ceil() as u64)
}

/// Convert a CPU quantity to millicores, rounding up.
///
/// `"500m"` is 500, `"2"` is 2000, `"0.5"` is 500.
pub fn str_to_millis(quantity: &str) -> Result<u64> {
    let trimmed = quantity.trim();
    if let Some(millis) = trimmed.strip_suffix('m') {
        let value: f64 = millis.parse().map_err(|_| invalid_quantity(quantity))?;
        if value < 0.0 {
            return Err(invalid_quantity(quantity));
        }
        return Ok(value.ceil() as u64);
    }
    let value = parse_quantity(trimmed)?;
    Ok((value * 1000.0).ceil() as u64)
}

fn parse_quantity(quantity: &str) -> Result<f64> {
    let trimmed = quantity.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);

    let value: f64 = number.parse().map_err(|_| invalid_quantity(quantity))?;
    let multiplier = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        _ => return Err(invalid_quantity(quantity)),
    };

    Ok(value * multiplier)
}

fn invalid_quantity(quantity: &str) -> Error {
    Error::invalid_argument(format!("invalid resource quantity {:?}", quantity))
}
