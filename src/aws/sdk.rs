//! AWS SDK backed transport.
//!
//! [`SdkConnector`] builds one SDK client per service and region from a
//! shared [`SdkConfig`], applying the retry mode, attempt count, backoff cap
//! and timeouts of the requesting [`ClientConfig`]. Retries, backoff and the
//! adaptive client-side rate limiter all run inside the SDK.
//!
//! [`SdkTransport`] maps an [`ApiRequest`] onto the typed SDK operation and
//! renders the output back into the JSON shape the callers read. Paginated
//! listings are drained with the SDK paginators, so a listing comes back as a
//! single page without a continuation token.

use crate::aws::api::{
    default_code_for_status, ApiError, ApiRequest, Connector, Transport, DEFAULT_REGION,
};
use crate::parallel::client::{ClientConfig, ConfigError};
use aws_sdk_cloudwatch::primitives::DateTime;
use aws_sdk_cloudwatch::types::{Datapoint, Dimension, Statistic};
use aws_sdk_servicequotas::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_servicequotas::types::ServiceQuota;
use aws_types::region::Region;
use aws_types::SdkConfig;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Service name of the Service Quotas API.
pub const QUOTAS_SERVICE: &str = "service-quotas";
/// Service name of the CloudWatch metrics API.
pub const METRICS_SERVICE: &str = "cloudwatch";

const DEFAULT_PAGE_SIZE: i32 = 100;
const DEFAULT_PERIOD_SECS: i32 = 300;

/// Builds SDK-backed transports from one loaded AWS configuration.
pub struct SdkConnector {
    config: SdkConfig,
    runtime: Handle,
}

impl SdkConnector {
    pub fn new(config: SdkConfig, runtime: Handle) -> Self {
        Self { config, runtime }
    }

    fn region(&self, region: Option<&str>) -> Region {
        region
            .map(|r| Region::new(r.to_string()))
            .or_else(|| self.config.region().cloned())
            .unwrap_or_else(|| Region::new(DEFAULT_REGION))
    }
}

impl Connector for SdkConnector {
    fn connect(
        &self,
        service: &str,
        region: Option<&str>,
        config: &ClientConfig,
    ) -> Result<Arc<dyn Transport>, ConfigError> {
        let region = self.region(region);
        let client = match service {
            QUOTAS_SERVICE => {
                let conf = aws_sdk_servicequotas::config::Builder::from(&self.config)
                    .region(region)
                    .retry_config(config.sdk_retry_config())
                    .timeout_config(config.sdk_timeout_config())
                    .build();
                ServiceClient::Quotas(aws_sdk_servicequotas::Client::from_conf(conf))
            }
            METRICS_SERVICE => {
                let conf = aws_sdk_cloudwatch::config::Builder::from(&self.config)
                    .region(region)
                    .retry_config(config.sdk_retry_config())
                    .timeout_config(config.sdk_timeout_config())
                    .build();
                ServiceClient::Metrics(aws_sdk_cloudwatch::Client::from_conf(conf))
            }
            other => ServiceClient::Unsupported(other.to_string()),
        };

        Ok(Arc::new(SdkTransport {
            client,
            runtime: self.runtime.clone(),
        }))
    }
}

enum ServiceClient {
    Quotas(aws_sdk_servicequotas::Client),
    Metrics(aws_sdk_cloudwatch::Client),
    /// Fails every call with `UnknownService`.
    Unsupported(String),
}

/// Transport over one SDK client.
///
/// Requests run on the runtime behind `runtime`; [`Transport::send`] blocks
/// the calling thread until the SDK returns, so it must be called from a
/// plain OS thread (an engine worker), never from inside an async task.
pub struct SdkTransport {
    client: ServiceClient,
    runtime: Handle,
}

impl fmt::Debug for SdkTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let service = match &self.client {
            ServiceClient::Quotas(_) => QUOTAS_SERVICE,
            ServiceClient::Metrics(_) => METRICS_SERVICE,
            ServiceClient::Unsupported(name) => name.as_str(),
        };
        f.debug_struct("SdkTransport")
            .field("service", &service)
            .finish_non_exhaustive()
    }
}

impl SdkTransport {
    async fn dispatch(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        match &self.client {
            ServiceClient::Quotas(client) => {
                quotas_call(client, &request.operation, &request.payload).await
            }
            ServiceClient::Metrics(client) => {
                metrics_call(client, &request.operation, &request.payload).await
            }
            ServiceClient::Unsupported(service) => Err(ApiError::unknown_service(service)),
        }
    }
}

impl Transport for SdkTransport {
    fn send(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        self.runtime.block_on(self.dispatch(request))
    }
}

async fn quotas_call(
    client: &aws_sdk_servicequotas::Client,
    operation: &str,
    payload: &Value,
) -> Result<Value, ApiError> {
    match operation {
        "ListServiceQuotas" => {
            let pages: Vec<_> = client
                .list_service_quotas()
                .service_code(required(payload, "ServiceCode", operation)?)
                .max_results(page_size(payload))
                .into_paginator()
                .send()
                .try_collect()
                .await
                .map_err(|e| sdk_error(operation, e))?;
            let quotas: Vec<Value> = pages
                .iter()
                .flat_map(|page| page.quotas())
                .map(quota_json)
                .collect();
            Ok(json!({ "Quotas": quotas }))
        }
        "ListAWSDefaultServiceQuotas" => {
            let pages: Vec<_> = client
                .list_aws_default_service_quotas()
                .service_code(required(payload, "ServiceCode", operation)?)
                .max_results(page_size(payload))
                .into_paginator()
                .send()
                .try_collect()
                .await
                .map_err(|e| sdk_error(operation, e))?;
            let quotas: Vec<Value> = pages
                .iter()
                .flat_map(|page| page.quotas())
                .map(quota_json)
                .collect();
            Ok(json!({ "Quotas": quotas }))
        }
        "GetServiceQuota" => {
            let output = client
                .get_service_quota()
                .service_code(required(payload, "ServiceCode", operation)?)
                .quota_code(required(payload, "QuotaCode", operation)?)
                .send()
                .await
                .map_err(|e| sdk_error(operation, e))?;
            Ok(match output.quota() {
                Some(quota) => json!({ "Quota": quota_json(quota) }),
                None => json!({}),
            })
        }
        other => Err(unsupported_operation(QUOTAS_SERVICE, other)),
    }
}

async fn metrics_call(
    client: &aws_sdk_cloudwatch::Client,
    operation: &str,
    payload: &Value,
) -> Result<Value, ApiError> {
    match operation {
        "GetMetricStatistics" => {
            let statistics: Vec<Statistic> = payload
                .get("Statistics")
                .and_then(Value::as_array)
                .map(|names| names.iter().filter_map(Value::as_str).map(Statistic::from).collect())
                .unwrap_or_else(|| vec![Statistic::Maximum]);
            let dimensions = payload
                .get("Dimensions")
                .and_then(Value::as_array)
                .map(|dims| dims.iter().map(dimension).collect::<Result<Vec<_>, _>>())
                .transpose()?;
            let period = payload
                .get("Period")
                .and_then(Value::as_i64)
                .and_then(|p| i32::try_from(p).ok())
                .unwrap_or(DEFAULT_PERIOD_SECS);

            let output = client
                .get_metric_statistics()
                .namespace(required(payload, "Namespace", operation)?)
                .metric_name(required(payload, "MetricName", operation)?)
                .start_time(DateTime::from_secs(timestamp(payload, "StartTime", operation)?))
                .end_time(DateTime::from_secs(timestamp(payload, "EndTime", operation)?))
                .period(period)
                .set_statistics(Some(statistics))
                .set_dimensions(dimensions)
                .send()
                .await
                .map_err(|e| sdk_error(operation, e))?;

            let datapoints: Vec<Value> = output.datapoints().iter().map(datapoint_json).collect();
            Ok(json!({ "Label": output.label(), "Datapoints": datapoints }))
        }
        other => Err(unsupported_operation(METRICS_SERVICE, other)),
    }
}

fn unsupported_operation(service: &str, operation: &str) -> ApiError {
    ApiError::new(
        "UnsupportedOperation",
        format!("operation {} is not supported for {}", operation, service),
    )
}

fn validation_error(message: String) -> ApiError {
    ApiError::new("ValidationException", message).with_status(400)
}

fn required<'a>(payload: &'a Value, field: &str, operation: &str) -> Result<&'a str, ApiError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| validation_error(format!("{} requires {}", operation, field)))
}

fn timestamp(payload: &Value, field: &str, operation: &str) -> Result<i64, ApiError> {
    payload
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            validation_error(format!("{} requires {} in epoch seconds", operation, field))
        })
}

fn page_size(payload: &Value) -> i32 {
    payload
        .get("MaxResults")
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n.clamp(1, 100)).ok())
        .unwrap_or(DEFAULT_PAGE_SIZE)
}

fn dimension(value: &Value) -> Result<Dimension, ApiError> {
    let field = |name: &str| value.get(name).and_then(Value::as_str).unwrap_or_default();
    Ok(Dimension::builder()
        .name(field("Name"))
        .value(field("Value"))
        .build())
}

/// Render a quota in the Service Quotas wire shape.
pub fn quota_json(quota: &ServiceQuota) -> Value {
    let mut value = json!({
        "ServiceCode": quota.service_code(),
        "QuotaCode": quota.quota_code(),
        "QuotaName": quota.quota_name(),
        "Value": quota.value(),
        "Unit": quota.unit(),
        "Adjustable": quota.adjustable(),
        "GlobalQuota": quota.global_quota(),
    });
    if let Some(metric) = quota.usage_metric() {
        value["UsageMetric"] = json!({
            "MetricNamespace": metric.metric_namespace(),
            "MetricName": metric.metric_name(),
            "MetricDimensions": metric.metric_dimensions(),
            "MetricStatisticRecommendation": metric.metric_statistic_recommendation(),
        });
    }
    value
}

fn datapoint_json(point: &Datapoint) -> Value {
    json!({
        "Timestamp": point.timestamp().map(|t| t.secs()),
        "Maximum": point.maximum(),
        "Average": point.average(),
        "Unit": point.unit().map(|u| u.as_str()),
    })
}

/// Convert an SDK failure into an [`ApiError`].
///
/// Timeouts and dispatch failures get transport codes; service errors keep
/// the code the service returned, else a default for the HTTP status.
pub fn sdk_error<E>(operation: &str, err: SdkError<E>) -> ApiError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = match &err {
        SdkError::TimeoutError(_) => "RequestTimeout".to_string(),
        SdkError::DispatchFailure(failure) if failure.is_timeout() => {
            "RequestTimeout".to_string()
        }
        SdkError::DispatchFailure(_) => "ConnectionError".to_string(),
        SdkError::ConstructionFailure(_) => "ClientError".to_string(),
        _ => err
            .code()
            .map(str::to_string)
            .unwrap_or_else(|| default_code_for_status(status.unwrap_or_default()).to_string()),
    };
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} failed: {}", operation, DisplayErrorContext(&err)));

    let api = ApiError::new(code, message);
    match status {
        Some(status) => api.with_status(status),
        None => api,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::errors::ErrorCategory;
    use crate::parallel::quotas::QuotaInfo;
    use aws_sdk_servicequotas::operation::list_service_quotas::ListServiceQuotasError;
    use aws_sdk_servicequotas::types::MetricInfo;

    #[test]
    fn test_quota_json_feeds_quota_info() {
        let quota = ServiceQuota::builder()
            .service_code("ec2")
            .quota_code("L-0263D0A3")
            .quota_name("EC2-VPC Elastic IPs")
            .value(5.0)
            .adjustable(true)
            .usage_metric(
                MetricInfo::builder()
                    .metric_namespace("AWS/Usage")
                    .metric_name("ResourceCount")
                    .metric_dimensions("Service", "EC2")
                    .build(),
            )
            .build();

        let info = QuotaInfo::from_api("ec2", &quota_json(&quota));
        assert_eq!(info.quota_code(), "L-0263D0A3");
        assert_eq!(info.value(), 5.0);
        assert!(info.adjustable());
        assert!(!info.global_quota());

        let metric = info.usage_metric().unwrap();
        assert_eq!(metric.namespace, "AWS/Usage");
        assert_eq!(
            metric.dimensions,
            vec![("Service".to_string(), "EC2".to_string())]
        );
    }

    #[test]
    fn test_quota_json_without_metric() {
        let quota = ServiceQuota::builder().quota_code("L-1").value(10.0).build();
        let value = quota_json(&quota);
        assert!(value.get("UsageMetric").is_none());
        assert!(QuotaInfo::from_api("s3", &value).usage_metric().is_none());
    }

    #[test]
    fn test_timeout_maps_to_transient() {
        let err: SdkError<ListServiceQuotasError> = SdkError::timeout_error("deadline passed");
        let api = sdk_error("ListServiceQuotas", err);
        assert_eq!(api.code, "RequestTimeout");
        assert_eq!(api.status, None);
        assert_eq!(api.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_construction_failure_is_not_retryable() {
        let err: SdkError<ListServiceQuotasError> =
            SdkError::construction_failure("missing credentials");
        let api = sdk_error("ListServiceQuotas", err);
        assert_eq!(api.code, "ClientError");
        assert!(api.message.starts_with("ListServiceQuotas failed"));
        assert!(!api.is_retryable());
    }

    #[test]
    fn test_page_size_is_clamped() {
        assert_eq!(page_size(&json!({})), 100);
        assert_eq!(page_size(&json!({"MaxResults": 500})), 100);
        assert_eq!(page_size(&json!({"MaxResults": 0})), 1);
        assert_eq!(page_size(&json!({"MaxResults": 25})), 25);
    }

    #[test]
    fn test_missing_field_is_validation_error() {
        let err = required(&json!({}), "ServiceCode", "ListServiceQuotas").unwrap_err();
        assert_eq!(err.code, "ValidationException");
        assert_eq!(err.status, Some(400));

        let err = timestamp(&json!({"StartTime": "soon"}), "StartTime", "GetMetricStatistics")
            .unwrap_err();
        assert!(err.message.contains("epoch seconds"));
    }

    #[test]
    fn test_dimension_from_json() {
        let dim = dimension(&json!({"Name": "Service", "Value": "EC2"})).unwrap();
        assert_eq!(dim.name(), "Service");
        assert_eq!(dim.value(), "EC2");
    }
}
