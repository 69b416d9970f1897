//! Turning `up` flags (or interactive choices) into launch parameters.
//!
//! Region and instance type are checked against the provider catalogue. A
//! supplied image id is taken as-is; only interactive selection consults the
//! image catalogue.

use crate::error::{ParameterKind, ProvisionError, ProvisionResult};
use crate::provider::ComputeProvider;
use std::io::{BufRead, Write};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParameters {
    pub region: String,
    pub instance_type: String,
    pub image_id: String,
}

/// What the caller supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct ParameterFlags {
    pub region: Option<String>,
    pub instance_type: Option<String>,
    pub image_id: Option<String>,
}

pub struct ParameterResolver<'a, R, W> {
    provider: &'a dyn ComputeProvider,
    interactive: bool,
    input: R,
    output: W,
}

impl<'a, R: BufRead, W: Write> ParameterResolver<'a, R, W> {
    pub fn new(provider: &'a dyn ComputeProvider, interactive: bool, input: R, output: W) -> Self {
        Self {
            provider,
            interactive,
            input,
            output,
        }
    }

    pub async fn resolve(&mut self, flags: &ParameterFlags) -> ProvisionResult<LaunchParameters> {
        let region = self.region(flags.region.as_deref()).await?;
        let instance_type = self
            .instance_type(&region, flags.instance_type.as_deref())
            .await?;
        let image_id = self.image(&region, flags.image_id.as_deref()).await?;
        Ok(LaunchParameters {
            region,
            instance_type,
            image_id,
        })
    }

    pub async fn region(&mut self, flag: Option<&str>) -> ProvisionResult<String> {
        if flag.is_none() && !self.interactive {
            return Err(missing(ParameterKind::Region));
        }
        let regions = self.provider.list_regions().await?;
        self.pick(ParameterKind::Region, flag, &regions)
    }

    pub async fn instance_type(&mut self, region: &str, flag: Option<&str>) -> ProvisionResult<String> {
        if flag.is_none() && !self.interactive {
            return Err(missing(ParameterKind::InstanceType));
        }
        let types = self.provider.list_instance_types(region).await?;
        self.pick(ParameterKind::InstanceType, flag, &types)
    }

    pub async fn image(&mut self, region: &str, flag: Option<&str>) -> ProvisionResult<String> {
        if let Some(image) = flag {
            return Ok(image.to_string());
        }
        if !self.interactive {
            return Err(missing(ParameterKind::Image));
        }
        let images = self.provider.list_images(region).await?;
        self.choose(ParameterKind::Image, &images)
    }

    fn pick(
        &mut self,
        kind: ParameterKind,
        flag: Option<&str>,
        catalogue: &[String],
    ) -> ProvisionResult<String> {
        match flag {
            Some(value) if catalogue.iter().any(|c| c == value) => Ok(value.to_string()),
            Some(value) => Err(ProvisionError::invalid(
                kind,
                format!("{value} is not offered by the provider"),
            )),
            None => self.choose(kind, catalogue),
        }
    }

    fn choose(&mut self, kind: ParameterKind, catalogue: &[String]) -> ProvisionResult<String> {
        if catalogue.is_empty() {
            return Err(ProvisionError::invalid(kind, "provider offers no choices"));
        }

        let prompt_io = |e: std::io::Error| ProvisionError::invalid(kind, format!("prompt failed: {e}"));
        writeln!(self.output, "Available {kind}s:").map_err(prompt_io)?;
        for (i, item) in catalogue.iter().enumerate() {
            writeln!(self.output, "  [{i}] {item}").map_err(prompt_io)?;
        }
        write!(self.output, "Choose {kind} [0-{}]: ", catalogue.len() - 1).map_err(prompt_io)?;
        self.output.flush().map_err(prompt_io)?;

        let mut line = String::new();
        self.input.read_line(&mut line).map_err(prompt_io)?;
        let answer = line.trim();
        answer
            .parse::<usize>()
            .ok()
            .and_then(|i| catalogue.get(i))
            .cloned()
            .ok_or_else(|| ProvisionError::invalid(kind, format!("{answer:?} is not a listed choice")))
    }
}

fn missing(kind: ParameterKind) -> ProvisionError {
    ProvisionError::invalid(kind, "required unless running interactively")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{BootStatus, InstanceDescriptor, LaunchSpec};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Catalogue;

    #[async_trait]
    impl ComputeProvider for Catalogue {
        async fn list_regions(&self) -> ProvisionResult<Vec<String>> {
            Ok(vec!["eu-central-1".into(), "eu-west-1".into()])
        }
        async fn list_instance_types(&self, region: &str) -> ProvisionResult<Vec<String>> {
            assert_eq!(region, "eu-west-1");
            Ok(vec!["t2.micro".into(), "t3.small".into()])
        }
        async fn list_images(&self, _region: &str) -> ProvisionResult<Vec<String>> {
            Ok(vec!["ami-new".into(), "ami-old".into()])
        }
        async fn import_access_key(&self, _: &str, _: &str, _: &str) -> ProvisionResult<()> {
            unreachable!()
        }
        async fn delete_access_key(&self, _: &str, _: &str) -> ProvisionResult<()> {
            unreachable!()
        }
        async fn create_ingress_policy(&self, _: &str, _: &str) -> ProvisionResult<String> {
            unreachable!()
        }
        async fn delete_ingress_policy(&self, _: &str, _: &str) -> ProvisionResult<()> {
            unreachable!()
        }
        async fn launch_instance(&self, _: &LaunchSpec<'_>) -> ProvisionResult<String> {
            unreachable!()
        }
        async fn find_instance_by_tag(
            &self,
            _: &str,
            _: &str,
        ) -> ProvisionResult<Option<InstanceDescriptor>> {
            unreachable!()
        }
        async fn describe_instance(&self, _: &str, _: &str) -> ProvisionResult<InstanceDescriptor> {
            unreachable!()
        }
        async fn terminate_instance(&self, _: &str, _: &str) -> ProvisionResult<usize> {
            unreachable!()
        }
        async fn boot_status(&self, _: &str, _: &str) -> ProvisionResult<Option<BootStatus>> {
            unreachable!()
        }
    }

    fn flags(region: &str, instance_type: &str, image: Option<&str>) -> ParameterFlags {
        ParameterFlags {
            region: Some(region.into()),
            instance_type: Some(instance_type.into()),
            image_id: image.map(Into::into),
        }
    }

    #[tokio::test]
    async fn test_flags_validated_against_catalogue() {
        let mut resolver = ParameterResolver::new(&Catalogue, false, &b""[..], Vec::new());
        let params = resolver
            .resolve(&flags("eu-west-1", "t3.small", Some("ami-anything")))
            .await
            .expect("resolve");
        assert_eq!(
            params,
            LaunchParameters {
                region: "eu-west-1".into(),
                instance_type: "t3.small".into(),
                image_id: "ami-anything".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_region_rejected() {
        let mut resolver = ParameterResolver::new(&Catalogue, false, &b""[..], Vec::new());
        let err = resolver
            .resolve(&flags("mars-north-1", "t2.micro", Some("ami-1")))
            .await
            .expect_err("invalid");
        assert!(matches!(
            err,
            ProvisionError::InvalidParameter { kind: ParameterKind::Region, .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_image_without_interaction_rejected() {
        let mut resolver = ParameterResolver::new(&Catalogue, false, &b""[..], Vec::new());
        let err = resolver
            .resolve(&flags("eu-west-1", "t2.micro", None))
            .await
            .expect_err("invalid");
        assert!(matches!(
            err,
            ProvisionError::InvalidParameter { kind: ParameterKind::Image, .. }
        ));
    }

    #[tokio::test]
    async fn test_interactive_choices_by_index() {
        let mut output = Vec::new();
        let params = ParameterResolver::new(&Catalogue, true, &b"1\n0\n1\n"[..], &mut output)
            .resolve(&ParameterFlags::default())
            .await
            .expect("resolve");
        assert_eq!(params.region, "eu-west-1");
        assert_eq!(params.instance_type, "t2.micro");
        assert_eq!(params.image_id, "ami-old");

        let shown = String::from_utf8(output).expect("utf8");
        assert!(shown.contains("[1] eu-west-1"));
        assert!(shown.contains("Choose instance type [0-1]: "));
    }

    #[tokio::test]
    async fn test_interactive_out_of_range_rejected() {
        let mut resolver = ParameterResolver::new(&Catalogue, true, &b"7\n"[..], Vec::new());
        let err = resolver.region(None).await.expect_err("out of range");
        assert!(err.to_string().contains("\"7\" is not a listed choice"));
    }
}
