use aws_audit_tools::commands::ip_lookup::{self, OutputFormat, ProviderSource};
use aws_audit_tools::commands::quotas::{self, RegionReport};
use aws_audit_tools::parallel::QuotaInfo;
use std::fs::{self, File};
use std::io::Write;
use tempfile::TempDir;

fn source(name: &str, path: &std::path::Path) -> ProviderSource {
    ProviderSource {
        name: name.to_string(),
        path: path.to_str().unwrap().to_string(),
    }
}

fn write_aws_ranges(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("ip-ranges.json");
    let mut file = File::create(&path).unwrap();
    let document = serde_json::json!({
        "prefixes": [
            {"ip_prefix": "3.5.140.0/22", "region": "ap-northeast-2", "service": "AMAZON"}
        ]
    });
    write!(file, "{}", document).unwrap();
    path
}

#[test]
fn test_ip_lookup_with_missing_file() {
    let dir = TempDir::new().unwrap();
    let result = ip_lookup::run(
        &[source("aws", &dir.path().join("missing.json"))],
        &["3.5.140.2".to_string()],
        "radix",
        OutputFormat::Text,
    );

    assert!(result.is_err());
}

#[test]
fn test_ip_lookup_with_malformed_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.json");
    fs::write(&path, "{\"prefixes\": [").unwrap();

    let result = ip_lookup::run(
        &[source("aws", &path)],
        &["3.5.140.2".to_string()],
        "radix",
        OutputFormat::Json,
    );

    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse JSON"));
}

#[test]
fn test_ip_lookup_invalid_backend() {
    let dir = TempDir::new().unwrap();
    let path = write_aws_ranges(&dir);

    let result = ip_lookup::run(
        &[source("aws", &path)],
        &["3.5.140.2".to_string()],
        "btree",
        OutputFormat::Text,
    );

    assert!(result.unwrap_err().to_string().contains("unknown backend"));
}

#[test]
fn test_ip_lookup_succeeds_for_both_formats() {
    let dir = TempDir::new().unwrap();
    let path = write_aws_ranges(&dir);
    let ips = vec!["3.5.140.2".to_string(), "not-an-ip".to_string()];

    assert!(ip_lookup::run(&[source("aws", &path)], &ips, "radix", OutputFormat::Text).is_ok());
    assert!(ip_lookup::run(&[source("aws", &path)], &ips, "array", OutputFormat::Json).is_ok());
}

#[test]
fn test_unknown_provider_loads_nothing() {
    let dir = TempDir::new().unwrap();
    let path = write_aws_ranges(&dir);

    let index =
        ip_lookup::load_index(&[source("digitalocean", &path)], Default::default()).unwrap();

    assert_eq!(index.prefix_count(), 0);
    assert!(index.loaded_providers().is_empty());
}

#[test]
fn test_quota_csv_creates_output_directory() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("reports").join("ec2.csv");
    let report = RegionReport {
        profile: "default".to_string(),
        region: "eu-west-1".to_string(),
        quotas: vec![
            QuotaInfo::new("ec2", "L-0263D0A3", "EC2-VPC Elastic IPs", 5.0).with_usage(Some(5.0)),
        ],
    };

    let rows = quotas::write_csv(output.to_str().unwrap(), &[&report]).unwrap();

    assert_eq!(rows, 1);
    let contents = fs::read_to_string(&output).unwrap();
    assert!(contents.contains(
        "default,eu-west-1,ec2,L-0263D0A3,EC2-VPC Elastic IPs,5,5,100.00,exceeded,false"
    ));
}
