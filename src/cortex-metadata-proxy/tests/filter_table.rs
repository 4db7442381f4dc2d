//! Decision engine table tests.
//!
//! Each row is a raw request-target and the verdict the engine must reach:
//! the canonical path on allow, or the exact deny message.

use cortex_metadata_proxy::{FilterError, IncomingRequest, PathMatching, PolicyEngine};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method};
use pretty_assertions::assert_eq;

const API_NOT_ALLOWED: &str = "This metadata API is not allowed by the metadata proxy.";
const CONCEALED: &str = "This metadata endpoint is concealed.";
const RECURSIVE: &str = "?recursive calls are not allowed by the metadata proxy.";
const XFF: &str = "Calls with X-Forwarded-For header are not allowed by the metadata proxy.";
const PARSE: &str = "Metadata proxy could not safely parse request.";

fn run(engine: &PolicyEngine, target: &str, headers: &HeaderMap) -> Result<String, String> {
    engine
        .filter(&IncomingRequest::new(&Method::GET, target, headers))
        .map(|path| path.into_string())
        .map_err(|e| e.to_string())
}

fn check_table(engine: &PolicyEngine, table: &[(&str, Result<&str, &str>)]) {
    let headers = HeaderMap::new();
    for (target, expected) in table {
        let expected = expected.map(str::to_string).map_err(str::to_string);
        assert_eq!(run(engine, target, &headers), expected, "target {:?}", target);
    }
}

// ============================================================================
// URL TABLE
// ============================================================================

mod url_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(PathMatching::CaseSensitive).unwrap()
    }

    #[test]
    fn test_discovery_and_base() {
        check_table(
            &engine(),
            &[
                ("", Ok("")),
                ("/", Ok("/")),
                ("/0.1", Ok("/0.1")),
                ("/0.1/", Ok("/0.1/")),
                ("/0.1/meta-data", Ok("/0.1/meta-data")),
                ("/0.1/meta-data/", Ok("/0.1/meta-data/")),
                ("/computeMetadata/v1beta1", Ok("/computeMetadata/v1beta1")),
                ("/computeMetadata/v1beta1/", Ok("/computeMetadata/v1beta1/")),
                ("/computeMetadata/v1", Ok("/computeMetadata/v1")),
                ("/computeMetadata/v1/", Ok("/computeMetadata/v1/")),
            ],
        );
    }

    #[test]
    fn test_service_account_tokens() {
        check_table(
            &engine(),
            &[
                (
                    "/computeMetadata/v1/instance/service-accounts/default/token",
                    Ok("/computeMetadata/v1/instance/service-accounts/default/token"),
                ),
                (
                    "/computeMetadata/v1/instance/service-accounts/12345-compute@developer.gserviceaccount.com/token",
                    Ok("/computeMetadata/v1/instance/service-accounts/12345-compute@developer.gserviceaccount.com/token"),
                ),
                (
                    "/computeMetadata/v1/instance/service-accounts/default/token?scopes=a,b",
                    Ok("/computeMetadata/v1/instance/service-accounts/default/token"),
                ),
            ],
        );
    }

    #[test]
    fn test_recursive_substring_is_unknown_key() {
        let headers = HeaderMap::new();
        let engine = engine();
        for target in [
            "/computeMetadata/v1/instance/?nonrecursive=true",
            "/computeMetadata/v1/instance/?something=other&nonrecursive=true",
        ] {
            let err = engine
                .filter(&IncomingRequest::new(&Method::GET, target, &headers))
                .unwrap_err();
            assert_eq!(err, FilterError::QueryKeyNotAllowed("nonrecursive".to_string()));
        }
    }

    #[test]
    fn test_other_api_versions() {
        check_table(
            &engine(),
            &[
                ("/0.2/", Err(API_NOT_ALLOWED)),
                ("/computeMetadata/v2/", Err(API_NOT_ALLOWED)),
                ("/COMPUTEMETADATA/V1/", Err(API_NOT_ALLOWED)),
                ("/computeMetadata/v1beta2/instance/", Err(API_NOT_ALLOWED)),
            ],
        );
    }

    #[test]
    fn test_kube_env() {
        check_table(
            &engine(),
            &[
                ("/0.1/meta-data/attributes/kube-env", Err(CONCEALED)),
                ("/computeMetadata/v1beta1/instance/attributes/kube-env", Err(CONCEALED)),
                ("/computeMetadata/v1/instance/attributes/kube-env", Err(CONCEALED)),
                ("/computeMetadata/v1/instance/attributes/kube-env/", Err(CONCEALED)),
            ],
        );
    }

    #[test]
    fn test_vm_identity() {
        check_table(
            &engine(),
            &[
                ("/0.1/meta-data/service-accounts/default/identity", Err(CONCEALED)),
                (
                    "/computeMetadata/v1beta1/instance/service-accounts/default/identity",
                    Err(CONCEALED),
                ),
                (
                    "/computeMetadata/v1/instance/service-accounts/default/identity",
                    Err(CONCEALED),
                ),
                (
                    "/computeMetadata/v1/instance/service-accounts/default/identity?audience=x&format=full",
                    Err(CONCEALED),
                ),
            ],
        );
    }

    #[test]
    fn test_recursive() {
        check_table(
            &engine(),
            &[
                ("/computeMetadata/v1/instance/?recursive=true", Err(RECURSIVE)),
                ("/computeMetadata/v1/instance/?something=other&recursive=true", Err(RECURSIVE)),
                ("/computeMetadata/v1/instance/?recursive=true&something=other", Err(RECURSIVE)),
                ("/computeMetadata/v1/instance/?%72ecursive=true", Err(RECURSIVE)),
                (
                    "/computeMetadata/v1/instance/service-accounts/?recursive=true",
                    Ok("/computeMetadata/v1/instance/service-accounts/"),
                ),
                (
                    "/computeMetadata/v1/instance/service-accounts/default/?recursive=true",
                    Ok("/computeMetadata/v1/instance/service-accounts/default/"),
                ),
            ],
        );
    }

    #[test]
    fn test_traversal_and_encoding() {
        check_table(
            &engine(),
            &[
                ("/computeMetadata/v1/instance/attributes//kube-env", Err(CONCEALED)),
                ("/computeMetadata/v1/instance/attributes/../attributes/kube-env", Err(CONCEALED)),
                ("/computeMetadata/v1/instance/attributes/%6bube-env", Err(CONCEALED)),
                (
                    "/computeMetadata/v1/instance/attributes/%2e%2e/attributes/kube-env",
                    Err(CONCEALED),
                ),
                ("/computeMetadata/v1/../../0.2/", Err(API_NOT_ALLOWED)),
                (
                    "/computeMetadata/v1/instance/./hostname",
                    Ok("/computeMetadata/v1/instance/hostname"),
                ),
            ],
        );
    }

    #[test]
    fn test_unparseable_targets() {
        check_table(
            &engine(),
            &[
                ("opaquescheme:computeMetadata/v1/instance/attributes/kube-env", Err(PARSE)),
                ("/computeMetadata/v1/instance/attributes/%zz", Err(PARSE)),
            ],
        );
    }

    #[test]
    fn test_backslash_and_control_characters() {
        check_table(
            &engine(),
            &[
                ("/computeMetadata/v1/instance/attributes%5Ckube-env", Err(PARSE)),
                (
                    "/computeMetadata/v1/instance/service-accounts/default%5Cidentity",
                    Err(PARSE),
                ),
                ("/computeMetadata/v1/instance/attributes/x%5C..%5Ckube-env", Err(PARSE)),
                ("/computeMetadata/v1/instance/attributes/kube-en%0Av", Err(PARSE)),
                ("/computeMetadata/v1/instance/attributes/kube%09-env", Err(PARSE)),
                ("/computeMetadata/v1/instance/hostname%0D", Err(PARSE)),
            ],
        );
    }

    #[test]
    fn test_semicolon_is_not_a_query_separator() {
        check_table(
            &engine(),
            &[
                (
                    "/computeMetadata/v1/instance/?alt=json;recursive=true",
                    Ok("/computeMetadata/v1/instance/"),
                ),
                (
                    "/computeMetadata/v1/instance/?alt=json&x;recursive=true",
                    Err("Query parameter \"x;recursive\" is not allowed by the metadata proxy."),
                ),
            ],
        );
    }

    #[test]
    fn test_absolute_form() {
        check_table(
            &engine(),
            &[
                ("http://169.254.169.254/computeMetadata/v1/", Ok("/computeMetadata/v1/")),
                (
                    "http://metadata.google.internal/computeMetadata/v1/instance/attributes/kube-env",
                    Err(CONCEALED),
                ),
            ],
        );
    }

    #[test]
    fn test_case_insensitive_deployment() {
        let engine = PolicyEngine::new(PathMatching::CaseInsensitive).unwrap();
        check_table(
            &engine,
            &[
                ("/COMPUTEMETADATA/V1/", Ok("/COMPUTEMETADATA/V1/")),
                ("/ComputeMetadata/v1/instance/attributes/Kube-Env", Err(CONCEALED)),
                (
                    "/computemetadata/v1/instance/service-accounts/default/IDENTITY",
                    Err(CONCEALED),
                ),
                ("/0.2/", Err(API_NOT_ALLOWED)),
            ],
        );
    }

    #[test]
    fn test_canonicalization_idempotent() {
        let engine = engine();
        let headers = HeaderMap::new();
        for target in [
            "/computeMetadata/v1/instance/./zone",
            "/computeMetadata/v1//instance//zone/",
            "/0.1/meta-data/../meta-data/hostname",
        ] {
            let first = run(&engine, target, &headers).unwrap();
            let second = run(&engine, &first, &headers).unwrap();
            assert_eq!(first, second, "target {:?}", target);
        }
    }
}

// ============================================================================
// HEADER TABLE
// ============================================================================

mod header_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_header_table() {
        let engine = PolicyEngine::new(PathMatching::CaseSensitive).unwrap();
        let table: &[(&[(&str, &str)], Result<&str, &str>)] = &[
            (&[], Ok("")),
            (&[("My-Header", "Hello")], Ok("")),
            (&[("X-Forwarded-For", "That other person")], Err(XFF)),
            (&[("My-Header", "Hello"), ("X-Forwarded-For", "That other person")], Err(XFF)),
            (&[("x-forwarded-for", "")], Err(XFF)),
        ];

        for (pairs, expected) in table {
            let expected = expected.map(str::to_string).map_err(str::to_string);
            assert_eq!(run(&engine, "", &headers(pairs)), expected, "headers {:?}", pairs);
        }
    }

    #[test]
    fn test_header_denies_regardless_of_path() {
        let engine = PolicyEngine::new(PathMatching::CaseSensitive).unwrap();
        let xff = headers(&[("X-Forwarded-For", "10.0.0.1")]);
        for target in [
            "/computeMetadata/v1/instance/service-accounts/default/token",
            "/0.2/",
            "opaquescheme:computeMetadata/v1/",
            "/computeMetadata/v1/instance/?recursive=true",
        ] {
            assert_eq!(run(&engine, target, &xff), Err(XFF.to_string()), "target {:?}", target);
        }
    }
}
