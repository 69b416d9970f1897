//! EC2 implementation of [`ComputeProvider`] over the Query API.
//!
//! Requests are form-encoded POSTs signed with SigV4; responses are XML.

use crate::error::{ProvisionError, ProvisionResult};
use crate::provider::{BootStatus, ComputeProvider, InstanceDescriptor, LaunchSpec};
use crate::sigv4::{FORM_CONTENT_TYPE, Signer};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const API_VERSION: &str = "2016-11-15";
const SERVICE: &str = "ec2";
const TAG_DESCRIPTION_PREFIX: &str = "tsnode managed";

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Ec2Settings {
    /// Region queried for the region catalogue itself.
    pub catalog_region: String,
    /// Image name pattern offered to `up`.
    pub image_name_filter: String,
    pub image_owner: String,
    /// TCP port opened by the ingress policy.
    pub ingress_port: u16,
    pub request_timeout: Duration,
    /// Send every call to this URL instead of the regional endpoint.
    pub endpoint: Option<String>,
}

impl Default for Ec2Settings {
    fn default() -> Self {
        Self {
            catalog_region: "eu-central-1".to_string(),
            image_name_filter: "ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*"
                .to_string(),
            image_owner: "099720109477".to_string(),
            ingress_port: 22,
            request_timeout: Duration::from_secs(10),
            endpoint: None,
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum Ec2Error {
    #[error("{code}: {message} (HTTP {status})")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid endpoint {endpoint}: {reason}")]
    Endpoint { endpoint: String, reason: String },

    #[error("request signing failed: {0}")]
    Signing(String),

    #[error("unreadable {action} response: {source}")]
    Decode {
        action: &'static str,
        #[source]
        source: quick_xml::DeError,
    },
}

impl Ec2Error {
    /// The security group is already gone, or never existed where we looked.
    fn is_missing_group(&self) -> bool {
        match self {
            Ec2Error::Api { code, message, .. } => {
                code.contains("NotFound") || message.contains("does not exist in default VPC")
            }
            _ => false,
        }
    }

    /// EC2 has not caught up with a just-launched instance yet.
    fn is_unknown_instance(&self) -> bool {
        matches!(self, Ec2Error::Api { code, .. } if code == "InvalidInstanceID.NotFound")
    }

    fn from_body(status: u16, body: &str) -> Self {
        match quick_xml::de::from_str::<ErrorResponse>(body) {
            Ok(resp) if !resp.errors.errors.is_empty() => {
                let first = resp.errors.errors.into_iter().next().unwrap_or_default();
                Ec2Error::Api {
                    status,
                    code: first.code,
                    message: first.message,
                }
            }
            _ => Ec2Error::Api {
                status,
                code: "Unknown".to_string(),
                message: body.chars().take(200).collect(),
            },
        }
    }
}

// ─── Query builder ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Query {
    action: &'static str,
    params: Vec<(String, String)>,
    filters: usize,
}

impl Query {
    fn new(action: &'static str) -> Self {
        Self {
            action,
            params: vec![
                ("Action".to_string(), action.to_string()),
                ("Version".to_string(), API_VERSION.to_string()),
            ],
            filters: 0,
        }
    }

    fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    fn filter(mut self, name: &str, values: &[&str]) -> Self {
        self.filters += 1;
        let n = self.filters;
        self = self.param(format!("Filter.{n}.Name"), name);
        for (i, value) in values.iter().enumerate() {
            self = self.param(format!("Filter.{n}.Value.{}", i + 1), *value);
        }
        self
    }

    /// `Name` and `Description` tags on the created resource.
    fn tags(self, resource_type: &str, name: &str) -> Self {
        self.param("TagSpecification.1.ResourceType", resource_type)
            .param("TagSpecification.1.Tag.1.Key", "Name")
            .param("TagSpecification.1.Tag.1.Value", name)
            .param("TagSpecification.1.Tag.2.Key", "Description")
            .param(
                "TagSpecification.1.Tag.2.Value",
                format!("{TAG_DESCRIPTION_PREFIX} {resource_type}"),
            )
    }

    fn encode(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.params.iter())
            .finish()
    }
}

// ─── Response shapes ─────────────────────────────────────────────────────────

/// EC2 wraps every list in `<item>` elements.
#[derive(Debug, Deserialize)]
struct ItemSet<T> {
    #[serde(rename = "item", default = "Vec::new")]
    items: Vec<T>,
}

impl<T> Default for ItemSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
struct Ack {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeRegionsResponse {
    #[serde(default)]
    region_info: ItemSet<RegionItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegionItem {
    region_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeInstanceTypeOfferingsResponse {
    #[serde(default)]
    instance_type_offering_set: ItemSet<OfferingItem>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferingItem {
    instance_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeImagesResponse {
    #[serde(default)]
    images_set: ItemSet<ImageItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageItem {
    image_id: String,
    #[serde(default)]
    creation_date: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSecurityGroupResponse {
    group_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunInstancesResponse {
    #[serde(default)]
    instances_set: ItemSet<InstanceIdItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceIdItem {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    reservation_set: ItemSet<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reservation {
    #[serde(default)]
    instances_set: ItemSet<InstanceItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceItem {
    instance_id: String,
    instance_state: InstanceStateItem,
    ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceStateItem {
    name: String,
}

impl From<InstanceItem> for InstanceDescriptor {
    fn from(item: InstanceItem) -> Self {
        Self {
            id: item.instance_id,
            state: item.instance_state.name,
            address: item.ip_address.filter(|a| !a.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminateInstancesResponse {
    #[serde(default)]
    instances_set: ItemSet<InstanceIdItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeInstanceStatusResponse {
    #[serde(default)]
    instance_status_set: ItemSet<InstanceStatusItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceStatusItem {
    instance_status: StatusSummary,
}

#[derive(Debug, Deserialize)]
struct StatusSummary {
    status: String,
    #[serde(default)]
    details: ItemSet<StatusDetail>,
}

#[derive(Debug, Deserialize)]
struct StatusDetail {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorResponse {
    #[serde(default)]
    errors: ErrorList,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorList {
    #[serde(rename = "Error", default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiErrorItem {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

// ─── Provider ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Ec2Provider {
    credentials: AwsCredentials,
    settings: Ec2Settings,
    client: reqwest::Client,
}

impl Ec2Provider {
    pub fn new(credentials: AwsCredentials, settings: Ec2Settings) -> ProvisionResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(concat!("tsnode/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProvisionError::remote("build HTTP client", e))?;
        Ok(Self {
            credentials,
            settings,
            client,
        })
    }

    pub fn settings(&self) -> &Ec2Settings {
        &self.settings
    }

    fn endpoint(&self, region: &str) -> String {
        match &self.settings.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://ec2.{region}.amazonaws.com/"),
        }
    }

    async fn send<T: DeserializeOwned>(&self, region: &str, query: Query) -> Result<T, Ec2Error> {
        let endpoint = self.endpoint(region);
        let url = Url::parse(&endpoint).map_err(|e| Ec2Error::Endpoint {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(Ec2Error::Endpoint {
                    endpoint,
                    reason: "no host".to_string(),
                });
            }
        };

        let body = query.encode();
        let signed = Signer {
            access_key_id: &self.credentials.access_key_id,
            secret_access_key: &self.credentials.secret_access_key,
            region,
            service: SERVICE,
        }
        .sign(&host, &body, Utc::now())
        .map_err(|e| Ec2Error::Signing(e.to_string()))?;

        debug!(action = query.action, region, "ec2 request");
        let resp = self
            .client
            .post(url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .header("x-amz-date", signed.amz_date)
            .header(AUTHORIZATION, signed.authorization)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(Ec2Error::from_body(status.as_u16(), &text));
        }

        quick_xml::de::from_str(&text).map_err(|source| Ec2Error::Decode {
            action: query.action,
            source,
        })
    }

    async fn call<T: DeserializeOwned>(&self, region: &str, query: Query) -> ProvisionResult<T> {
        let action = query.action;
        self.send(region, query)
            .await
            .map_err(|e| ProvisionError::remote(action, e))
    }

    async fn describe_instances(
        &self,
        region: &str,
        query: Query,
    ) -> ProvisionResult<Option<InstanceDescriptor>> {
        let resp: DescribeInstancesResponse = self.call(region, query).await?;
        let Some(reservation) = resp.reservation_set.items.into_iter().next() else {
            return Ok(None);
        };
        let mut instances = reservation.instances_set.items;
        if instances.len() != 1 {
            return Err(ProvisionError::UnexpectedCardinality {
                operation: "DescribeInstances",
                expected: 1,
                actual: instances.len(),
            });
        }
        Ok(instances.pop().map(InstanceDescriptor::from))
    }
}

#[async_trait]
impl ComputeProvider for Ec2Provider {
    async fn list_regions(&self) -> ProvisionResult<Vec<String>> {
        let resp: DescribeRegionsResponse = self
            .call(&self.settings.catalog_region, Query::new("DescribeRegions"))
            .await?;
        let mut regions: Vec<String> = resp
            .region_info
            .items
            .into_iter()
            .map(|r| r.region_name)
            .collect();
        regions.sort();
        Ok(regions)
    }

    async fn list_instance_types(&self, region: &str) -> ProvisionResult<Vec<String>> {
        let mut types = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut query = Query::new("DescribeInstanceTypeOfferings")
                .param("LocationType", "region")
                .filter("location", &[region]);
            if let Some(token) = next_token.take() {
                query = query.param("NextToken", token);
            }

            let page: DescribeInstanceTypeOfferingsResponse = self.call(region, query).await?;
            types.extend(
                page.instance_type_offering_set
                    .items
                    .into_iter()
                    .map(|o| o.instance_type),
            );
            match page.next_token.filter(|t| !t.is_empty()) {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }
        types.sort();
        types.dedup();
        debug!(region, count = types.len(), "instance type offerings listed");
        Ok(types)
    }

    async fn list_images(&self, region: &str) -> ProvisionResult<Vec<String>> {
        let query = Query::new("DescribeImages")
            .param("Owner.1", self.settings.image_owner.as_str())
            .filter("name", &[self.settings.image_name_filter.as_str()]);
        let resp: DescribeImagesResponse = self.call(region, query).await?;
        let mut images = resp.images_set.items;
        // Newest first; creation dates are ISO-8601 strings.
        images.sort_by(|a, b| b.creation_date.cmp(&a.creation_date));
        Ok(images.into_iter().map(|i| i.image_id).collect())
    }

    async fn import_access_key(
        &self,
        region: &str,
        name: &str,
        public_key: &str,
    ) -> ProvisionResult<()> {
        let query = Query::new("ImportKeyPair")
            .param("KeyName", name)
            .param("PublicKeyMaterial", STANDARD.encode(public_key.as_bytes()))
            .tags("key-pair", name);
        let _: Ack = self.call(region, query).await?;
        info!(region, name, "access key imported");
        Ok(())
    }

    async fn delete_access_key(&self, region: &str, name: &str) -> ProvisionResult<()> {
        let _: Ack = self
            .call(region, Query::new("DeleteKeyPair").param("KeyName", name))
            .await?;
        info!(region, name, "remote access key deleted");
        Ok(())
    }

    async fn create_ingress_policy(&self, region: &str, name: &str) -> ProvisionResult<String> {
        let query = Query::new("CreateSecurityGroup")
            .param("GroupName", name)
            .param("GroupDescription", format!("{TAG_DESCRIPTION_PREFIX} security group"))
            .tags("security-group", name);
        let created: CreateSecurityGroupResponse = self.call(region, query).await?;

        let port = self.settings.ingress_port.to_string();
        let query = Query::new("AuthorizeSecurityGroupIngress")
            .param("GroupId", created.group_id.as_str())
            .param("IpPermissions.1.IpProtocol", "tcp")
            .param("IpPermissions.1.FromPort", port.as_str())
            .param("IpPermissions.1.ToPort", port.as_str())
            .param("IpPermissions.1.IpRanges.1.CidrIp", "0.0.0.0/0");
        let _: Ack = self.call(region, query).await?;

        info!(region, name, group_id = %created.group_id, "ingress policy created");
        Ok(created.group_id)
    }

    async fn delete_ingress_policy(&self, region: &str, name: &str) -> ProvisionResult<()> {
        let query = Query::new("DeleteSecurityGroup").param("GroupName", name);
        match self.send::<Ack>(region, query).await {
            Ok(_) => {
                info!(region, name, "ingress policy deleted");
                Ok(())
            }
            Err(e) if e.is_missing_group() => {
                debug!(region, name, error = %e, "ingress policy already absent");
                Ok(())
            }
            Err(e) => Err(ProvisionError::remote("DeleteSecurityGroup", e)),
        }
    }

    async fn launch_instance(&self, spec: &LaunchSpec<'_>) -> ProvisionResult<String> {
        let query = Query::new("RunInstances")
            .param("ImageId", spec.image_id)
            .param("InstanceType", spec.instance_type)
            .param("MinCount", "1")
            .param("MaxCount", "1")
            .param("KeyName", spec.name)
            .param("SecurityGroupId.1", spec.ingress_policy_id)
            .tags("instance", spec.name);
        let resp: RunInstancesResponse = self.call(spec.region, query).await?;

        let mut launched = resp.instances_set.items;
        if launched.len() != 1 {
            return Err(ProvisionError::UnexpectedCardinality {
                operation: "RunInstances",
                expected: 1,
                actual: launched.len(),
            });
        }
        let instance_id = launched
            .pop()
            .map(|i| i.instance_id)
            .unwrap_or_default();
        info!(region = spec.region, name = spec.name, %instance_id, "instance launched");
        Ok(instance_id)
    }

    async fn find_instance_by_tag(
        &self,
        region: &str,
        name: &str,
    ) -> ProvisionResult<Option<InstanceDescriptor>> {
        let query = Query::new("DescribeInstances").filter("tag:Name", &[name]);
        self.describe_instances(region, query).await
    }

    async fn describe_instance(
        &self,
        region: &str,
        instance_id: &str,
    ) -> ProvisionResult<InstanceDescriptor> {
        let query = Query::new("DescribeInstances").param("InstanceId.1", instance_id);
        self.describe_instances(region, query)
            .await?
            .ok_or_else(|| ProvisionError::NotFound {
                kind: "instance",
                name: instance_id.to_string(),
            })
    }

    async fn terminate_instance(&self, region: &str, instance_id: &str) -> ProvisionResult<usize> {
        let query = Query::new("TerminateInstances").param("InstanceId.1", instance_id);
        let resp: TerminateInstancesResponse = self.call(region, query).await?;
        Ok(resp.instances_set.items.len())
    }

    async fn boot_status(
        &self,
        region: &str,
        instance_id: &str,
    ) -> ProvisionResult<Option<BootStatus>> {
        let query = Query::new("DescribeInstanceStatus").param("InstanceId.1", instance_id);
        let resp: DescribeInstanceStatusResponse = match self.send(region, query).await {
            Ok(resp) => resp,
            Err(e) if e.is_unknown_instance() => {
                debug!(instance_id, "instance not visible yet");
                return Ok(None);
            }
            Err(e) => return Err(ProvisionError::remote("DescribeInstanceStatus", e)),
        };
        Ok(resp.instance_status_set.items.into_iter().next().map(|item| {
            let detail = item
                .instance_status
                .details
                .items
                .into_iter()
                .next()
                .map(|d| d.status)
                .unwrap_or_default();
            BootStatus::new(item.instance_status.status, detail)
        }))
    }
}
