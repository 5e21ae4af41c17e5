use super::*;

use crate::domain::types::{SortDirection, SortField};

#[test]
fn defaults_match_the_dashboard_conventions() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.session.flush_interval, Duration::from_secs(2));
    assert_eq!(settings.session.reconnect_delay, Duration::from_secs(3));
    assert_eq!(settings.session.page_limit.get(), 100);
    assert_eq!(settings.session.kinds, WorkloadKind::ALL.to_vec());
    assert!(settings.session.namespace.is_empty());
    assert!(settings.session.max_reconnect_attempts.is_none());
    assert!(settings.session.keepalive_interval.is_none());
    assert_eq!(settings.cluster.cluster_api_namespace, "kubetail-system");
    assert_eq!(settings.cluster.cluster_api_service, "kubetail-cluster-api");
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.session.namespace = Some("from-file".into());
    raw.session.flush_interval_ms = Some(5_000);

    let args = WatchArgs {
        session: SessionOverrides {
            namespace: Some("kube-system".into()),
            flush_interval_ms: Some(250),
            ..Default::default()
        },
        ..Default::default()
    };
    raw.apply_watch_overrides(&args);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.session.namespace, "kube-system");
    assert_eq!(settings.session.flush_interval, Duration::from_millis(250));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let args = WatchArgs {
        logging: LoggingOverrides {
            log_json: Some(true),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_watch_overrides(&args);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_durations_and_limits_are_rejected() {
    let cases: [(&str, fn(&mut RawSettings)); 5] = [
        ("session.flush_interval_ms", |raw| {
            raw.session.flush_interval_ms = Some(0)
        }),
        ("session.reconnect_delay_ms", |raw| {
            raw.session.reconnect_delay_ms = Some(0)
        }),
        ("session.page_limit", |raw| raw.session.page_limit = Some(0)),
        ("session.row_limit", |raw| raw.session.row_limit = Some(0)),
        ("demo.tick_ms", |raw| raw.demo.tick_ms = Some(0)),
    ];

    for (expected, mutate) in cases {
        let mut raw = RawSettings::default();
        mutate(&mut raw);
        match Settings::from_raw(raw) {
            Err(LoadError::Invalid { key, .. }) => assert_eq!(key, expected),
            other => panic!("expected invalid `{expected}`, got {other:?}"),
        }
    }
}

#[test]
fn kinds_accept_comma_separated_strings() {
    let mut raw = RawSettings::default();
    raw.session.kinds = Some(RawKinds::One("pods, deployments,pods".into()));

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.session.kinds,
        vec![WorkloadKind::Pod, WorkloadKind::Deployment]
    );
}

#[test]
fn unknown_kind_is_rejected() {
    let mut raw = RawSettings::default();
    raw.session.kinds = Some(RawKinds::Many(vec!["services".into()]));

    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "session.kinds",
            ..
        })
    ));
}

#[test]
fn sort_key_is_parsed() {
    let mut raw = RawSettings::default();
    raw.session.sort = Some("size:desc".into());

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.session.sort,
        SortKey::Field {
            field: SortField::Size,
            direction: SortDirection::Desc,
        }
    );
}

#[test]
fn dashboard_url_must_be_http() {
    let mut raw = RawSettings::default();
    raw.cluster.dashboard_url = Some("ftp://example.com".into());

    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "cluster.dashboard_url",
            ..
        })
    ));
}

#[test]
fn endpoints_are_built_under_the_base_path() {
    let mut raw = RawSettings::default();
    raw.cluster.dashboard_url = Some("https://dash.example.com".into());
    raw.cluster.base_path = Some("tools/kubetail".into());

    let cluster = Settings::from_raw(raw).expect("valid settings").cluster;
    assert_eq!(cluster.base_path, "/tools/kubetail/");
    assert_eq!(
        cluster.dashboard_graphql_url().as_str(),
        "https://dash.example.com/tools/kubetail/graphql"
    );
    assert_eq!(
        cluster.cluster_api_graphql_url("kind/dev").as_str(),
        "https://dash.example.com/tools/kubetail/cluster-api-proxy/kind%2Fdev/kubetail-system/kubetail-cluster-api/graphql"
    );
    assert_eq!(
        websocket_url(&cluster.dashboard_graphql_url()).as_str(),
        "wss://dash.example.com/tools/kubetail/graphql"
    );
}

#[test]
fn explicit_cluster_api_url_bypasses_the_proxy() {
    let mut raw = RawSettings::default();
    raw.cluster.cluster_api_url = Some("http://127.0.0.1:50051/graphql".into());

    let cluster = Settings::from_raw(raw).expect("valid settings").cluster;
    assert_eq!(
        cluster.cluster_api_graphql_url("ignored").as_str(),
        "http://127.0.0.1:50051/graphql"
    );
}

#[test]
fn default_to_watch_command() {
    let args = CliArgs::parse_from(["tailview"]);
    let command = args
        .command
        .unwrap_or(Command::Watch(Box::<WatchArgs>::default()));
    assert!(matches!(command, Command::Watch(_)));
}

#[test]
fn parse_watch_overrides() {
    let args = CliArgs::parse_from([
        "tailview",
        "watch",
        "--namespace",
        "default",
        "--kinds",
        "pods,jobs",
        "--sort",
        "name:asc",
        "--offload-sort",
        "true",
        "--kube-context",
        "minikube",
    ]);

    match args.command.expect("watch command") {
        Command::Watch(watch) => {
            assert_eq!(watch.session.namespace.as_deref(), Some("default"));
            assert_eq!(
                watch.session.kinds,
                Some(vec!["pods".to_string(), "jobs".to_string()])
            );
            assert_eq!(watch.session.sort.as_deref(), Some("name:asc"));
            assert_eq!(watch.session.offload_sort, Some(true));
            assert_eq!(watch.cluster.kube_context.as_deref(), Some("minikube"));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_demo_arguments() {
    let args = CliArgs::parse_from(["tailview", "demo", "--demo-pods", "3", "--row-limit", "5"]);

    let Some(Command::Demo(demo)) = args.command else {
        panic!("wrong command parsed");
    };
    let mut raw = RawSettings::default();
    raw.apply_demo_overrides(&demo);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.demo.pods.get(), 3);
    assert_eq!(settings.session.row_limit.map(NonZeroUsize::get), Some(5));
}
