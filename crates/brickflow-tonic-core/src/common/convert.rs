use crate::{Error, proto};
use brickflow::{Access, ArbiterSnapshot, ResourceKey, ResourceSnapshot, TokenRequest};
use core::time::Duration;

impl From<Access> for proto::Access {
    fn from(access: Access) -> Self {
        match access {
            Access::Read => Self::Read,
            Access::Write => Self::Write,
        }
    }
}

impl From<proto::Access> for Access {
    fn from(access: proto::Access) -> Self {
        match access {
            proto::Access::Read => Self::Read,
            proto::Access::Write => Self::Write,
        }
    }
}

fn access_from_wire(raw: i32) -> Result<Access, Error> {
    proto::Access::try_from(raw)
        .map(Access::from)
        .map_err(|_| Error::InvalidRequest {
            reason: format!("unknown access mode {}", raw),
        })
}

impl From<&TokenRequest> for proto::AcquireRequest {
    fn from(request: &TokenRequest) -> Self {
        Self {
            resource_name: request.key.name.clone(),
            count: request.count,
            access: proto::Access::from(request.key.access) as i32,
            bytes: request.bytes,
            wait_timeout_ms: request
                .wait
                .map_or(0, |wait| u64::try_from(wait.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

impl TryFrom<proto::AcquireRequest> for TokenRequest {
    type Error = Error;

    fn try_from(message: proto::AcquireRequest) -> Result<Self, Self::Error> {
        if message.resource_name.is_empty() {
            return Err(Error::InvalidRequest {
                reason: "resource name must not be empty".to_string(),
            });
        }
        let key = ResourceKey::new(message.resource_name, access_from_wire(message.access)?);
        let request = TokenRequest::new(key, message.count).with_bytes(message.bytes);
        Ok(match message.wait_timeout_ms {
            0 => request,
            ms => request.with_wait(Duration::from_millis(ms)),
        })
    }
}

impl From<&ResourceSnapshot> for proto::ResourceState {
    fn from(resource: &ResourceSnapshot) -> Self {
        Self {
            resource_name: resource.key.name.clone(),
            access: proto::Access::from(resource.key.access) as i32,
            ceiling: resource.ceiling,
            in_use: resource.in_use,
            queued: resource.queued as u64,
            bytes_in_flight: resource.bytes_in_flight,
        }
    }
}

impl TryFrom<proto::ResourceState> for ResourceSnapshot {
    type Error = Error;

    fn try_from(state: proto::ResourceState) -> Result<Self, Self::Error> {
        Ok(Self {
            key: ResourceKey::new(state.resource_name, access_from_wire(state.access)?),
            ceiling: state.ceiling,
            in_use: state.in_use,
            queued: usize::try_from(state.queued).unwrap_or(usize::MAX),
            bytes_in_flight: state.bytes_in_flight,
        })
    }
}

impl From<&ArbiterSnapshot> for proto::SnapshotResponse {
    fn from(snapshot: &ArbiterSnapshot) -> Self {
        Self {
            resources: snapshot.resources.iter().map(Into::into).collect(),
            outstanding_leases: snapshot.outstanding_leases as u64,
            leases_reclaimed: snapshot.reclaimed,
        }
    }
}

impl TryFrom<proto::SnapshotResponse> for ArbiterSnapshot {
    type Error = Error;

    fn try_from(message: proto::SnapshotResponse) -> Result<Self, Self::Error> {
        Ok(Self {
            resources: message
                .resources
                .into_iter()
                .map(ResourceSnapshot::try_from)
                .collect::<Result<_, _>>()?,
            outstanding_leases: usize::try_from(message.outstanding_leases).unwrap_or(usize::MAX),
            reclaimed: message.leases_reclaimed,
        })
    }
}
