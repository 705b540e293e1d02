//! Builds the `hello` (or legacy `isMaster`) handshake command and the client-metadata document
//! that rides inside it (§4.4 steps 1-4).

use bson::{doc, Document};

use crate::{
    bson_util::document_byte_len,
    compression::Compressor,
    error::Result,
    options::{ClientOptions, Credential},
};

/// The maximum encoded size of the `client` metadata document, per §4.4 step 2.
pub const CLIENT_METADATA_MAX_BYTES: usize = 512;

#[derive(Clone, Debug, serde::Serialize)]
pub struct DriverMetadata {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct OsMetadata {
    #[serde(rename = "type")]
    pub os_type: String,
    pub architecture: String,
}

/// One of the four FaaS families detected by inspecting environment variables (§4.4 step 3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FaasEnvironment {
    AwsLambda,
    AzureFunc,
    GcpFunc,
    Vercel,
}

impl FaasEnvironment {
    fn name(&self) -> &'static str {
        match self {
            FaasEnvironment::AwsLambda => "aws.lambda",
            FaasEnvironment::AzureFunc => "azure.func",
            FaasEnvironment::GcpFunc => "gcp.func",
            FaasEnvironment::Vercel => "vercel",
        }
    }
}

/// Reads the environment variables listed in §6 and returns the detected FaaS family along with
/// the subset of `{memory_mb, region, timeout_sec, url}` fields that family populates. If more
/// than one family is populated simultaneously, returns `None` so the caller omits `env`
/// entirely (§4.4 step 3).
pub(crate) fn detect_faas_environment(
    get_var: impl Fn(&str) -> Option<String>,
) -> Option<(FaasEnvironment, Document)> {
    let aws = get_var("AWS_EXECUTION_ENV").is_some() || get_var("AWS_LAMBDA_RUNTIME_API").is_some();
    let azure = get_var("FUNCTIONS_WORKER_RUNTIME").is_some();
    let gcp = get_var("K_SERVICE").is_some() || get_var("FUNCTION_NAME").is_some();
    let vercel = get_var("VERCEL").is_some();

    let families = [aws, azure, gcp, vercel].iter().filter(|p| **p).count();
    if families != 1 {
        return None;
    }

    if aws {
        let mut doc = doc! { "name": FaasEnvironment::AwsLambda.name() };
        if let Some(mem) = get_var("AWS_LAMBDA_FUNCTION_MEMORY_SIZE").and_then(|v| v.parse::<i32>().ok()) {
            doc.insert("memory_mb", mem);
        }
        if let Some(region) = get_var("AWS_REGION") {
            doc.insert("region", region);
        }
        Some((FaasEnvironment::AwsLambda, doc))
    } else if azure {
        Some((FaasEnvironment::AzureFunc, doc! { "name": FaasEnvironment::AzureFunc.name() }))
    } else if gcp {
        let mut doc = doc! { "name": FaasEnvironment::GcpFunc.name() };
        if let Some(mem) = get_var("FUNCTION_MEMORY_MB").and_then(|v| v.parse::<i32>().ok()) {
            doc.insert("memory_mb", mem);
        }
        if let Some(region) = get_var("FUNCTION_REGION") {
            doc.insert("region", region);
        }
        if let Some(timeout) = get_var("FUNCTION_TIMEOUT_SEC").and_then(|v| v.parse::<i32>().ok()) {
            doc.insert("timeout_sec", timeout);
        }
        Some((FaasEnvironment::GcpFunc, doc))
    } else {
        let mut doc = doc! { "name": FaasEnvironment::Vercel.name() };
        if let Some(region) = get_var("VERCEL_REGION") {
            doc.insert("region", region);
        }
        if let Some(url) = get_var("VERCEL_URL") {
            doc.insert("url", url);
        }
        Some((FaasEnvironment::Vercel, doc))
    }
}

/// Builds the `client` metadata document, applying the truncation priority order of §4.4 step 2:
/// drop `env.*` non-name fields, then `os.architecture`, then the whole `env` document, then
/// truncate `platform`; if nothing fits, return `None` so the caller omits `client` entirely.
pub(crate) fn build_client_metadata(
    app_name: Option<&str>,
    driver: &DriverMetadata,
    os: &OsMetadata,
    platform: &str,
    env: Option<Document>,
) -> Result<Option<Document>> {
    let mut doc = doc! {};
    if let Some(name) = app_name {
        doc.insert("application", doc! { "name": name });
    }
    doc.insert("driver", doc! { "name": driver.name.clone(), "version": driver.version.clone() });
    doc.insert("os", doc! { "type": os.os_type.clone(), "architecture": os.architecture.clone() });
    doc.insert("platform", platform);
    if let Some(env) = env {
        doc.insert("env", env);
    }

    if document_byte_len(&doc)? <= CLIENT_METADATA_MAX_BYTES {
        return Ok(Some(doc));
    }

    if let Some(env) = doc.get_document_mut("env").ok() {
        let name = env.get("name").cloned();
        env.clear();
        if let Some(name) = name {
            env.insert("name", name);
        }
    }
    if document_byte_len(&doc)? <= CLIENT_METADATA_MAX_BYTES {
        return Ok(Some(doc));
    }

    if let Some(os) = doc.get_document_mut("os").ok() {
        os.remove("architecture");
    }
    if document_byte_len(&doc)? <= CLIENT_METADATA_MAX_BYTES {
        return Ok(Some(doc));
    }

    doc.remove("env");
    if document_byte_len(&doc)? <= CLIENT_METADATA_MAX_BYTES {
        return Ok(Some(doc));
    }

    if let Some(platform_str) = doc.get_str("platform").ok().map(str::to_string) {
        for truncate_to in (0..platform_str.len()).rev().step_by(8) {
            doc.insert("platform", &platform_str[..truncate_to]);
            if document_byte_len(&doc)? <= CLIENT_METADATA_MAX_BYTES {
                return Ok(Some(doc));
            }
        }
    }

    Ok(None)
}

/// Builds the full `hello` (or legacy `isMaster`) command body, including compression,
/// `saslSupportedMechs`, and `loadBalanced`, per §4.4 steps 2 and 4.
pub(crate) fn build_hello_command(
    options: &ClientOptions,
    use_hello: bool,
    credential: Option<&Credential>,
    compressors: &[Compressor],
    client_metadata: Option<Document>,
) -> Result<Document> {
    let mut command = doc! {};
    let command_name = if use_hello { "hello" } else { "isMaster" };
    command.insert(command_name, 1);

    if let Some(metadata) = client_metadata {
        command.insert("client", metadata);
    }

    if !compressors.is_empty() {
        let names: Vec<String> = compressors.iter().map(|c| c.name().to_string()).collect();
        command.insert("compression", names);
    }

    if let Some(cred) = credential {
        if let Some(username) = &cred.username {
            let source = cred.source.clone().unwrap_or_else(|| "admin".to_string());
            command.insert("saslSupportedMechs", format!("{source}.{username}"));
        }
    }

    if options.load_balanced == Some(true) {
        command.insert("loadBalanced", true);
    }

    Ok(command)
}

#[cfg(test)]
mod test {
    use super::*;

    fn driver() -> DriverMetadata {
        DriverMetadata { name: "mongodb-core-driver".into(), version: "0.1.0".into() }
    }

    fn os() -> OsMetadata {
        OsMetadata { os_type: "linux".into(), architecture: "x86_64".into() }
    }

    #[test]
    fn small_metadata_fits_untouched() {
        let env = Some(doc! { "name": "aws.lambda", "memory_mb": 1024, "region": "us-east-1" });
        let doc = build_client_metadata(Some("myapp"), &driver(), &os(), "rustc 1.83", env)
            .unwrap()
            .unwrap();
        assert!(document_byte_len(&doc).unwrap() <= CLIENT_METADATA_MAX_BYTES);
        assert!(doc.contains_key("application"));
        assert!(doc.contains_key("env"));
    }

    #[test]
    fn oversized_app_name_drops_env_then_os_arch_then_env_then_truncates_platform() {
        let huge_name = "a".repeat(600);
        let env = Some(doc! { "name": "aws.lambda", "memory_mb": 1024, "region": "us-east-1" });
        let doc = build_client_metadata(Some(&huge_name), &driver(), &os(), "rustc 1.83", env)
            .unwrap()
            .unwrap();
        assert!(document_byte_len(&doc).unwrap() <= CLIENT_METADATA_MAX_BYTES);
    }

    #[test]
    fn faas_detection_requires_single_family() {
        use std::collections::HashMap;
        let mut vars = HashMap::new();
        vars.insert("AWS_EXECUTION_ENV".to_string(), "AWS_Lambda_java8".to_string());
        vars.insert("VERCEL".to_string(), "1".to_string());
        let result = detect_faas_environment(|k| vars.get(k).cloned());
        assert!(result.is_none());
    }

    #[test]
    fn faas_detection_picks_single_family() {
        use std::collections::HashMap;
        let mut vars = HashMap::new();
        vars.insert("AWS_EXECUTION_ENV".to_string(), "AWS_Lambda_java8".to_string());
        vars.insert("AWS_LAMBDA_FUNCTION_MEMORY_SIZE".to_string(), "1024".to_string());
        vars.insert("AWS_REGION".to_string(), "us-east-1".to_string());
        let (family, doc) = detect_faas_environment(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(family, FaasEnvironment::AwsLambda);
        assert_eq!(doc.get_i32("memory_mb").unwrap(), 1024);
    }
}
