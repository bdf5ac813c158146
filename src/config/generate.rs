pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# LOGROLL CONFIGURATION
# =============================================================================
# Each plugin section below is processed once per invocation: raw log objects
# in `source_container` are matched by `source_filename_pattern`, parsed by the
# plugin named in `class_path`, aggregated per hour, and written to
# `container_name`. Progress is recorded in `global.marker_container`.
#
# Two local steps feed the stores on each node:
#   logroll collect  writes stats files from the databases under `devices`
#   logroll ship     uploads files from `log_dir` into `source_container`
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/logroll/config.yml
#   3. /etc/logroll/config.yml

global:
  # Account holding the source, destination and marker containers
  swift_account: AUTH_ops

  storage:
    # 'filesystem' (local directory tree) or 'swift' (REST API)
    backend: filesystem
    root: /var/lib/logroll/objects
    # backend: swift
    # storage_url: https://swift.example.com/v1
    # auth_token: $env{LOGROLL_AUTH_TOKEN}
    # timeout: 30s

  # Container holding one progress marker per plugin
  marker_container: log_processing_data

  # Concurrent fetch/parse workers per plugin
  workers: 4

  # Abort any pass still running after this long (nothing is committed)
  # run_timeout: 50m

  # Warn when the same object has failed to parse this many passes in a row
  failure_warn_threshold: 3

  log_level: info
  # log_dir: /var/log/logroll

plugins:
  access:
    class_path: access
    source_container: log_data
    container_name: access_rollups
    source_filename_pattern: |
      (?P<year>[0-9]{4})/
      (?P<month>[0-1][0-9])/
      (?P<day>[0-3][0-9])/
      (?P<hour>[0-2][0-9])/
      .*\.gz$
    # Only objects from the last N hours are considered
    lookback_hours: 120
    # At most this many hourly windows are processed per pass
    # lookback_window: 24
    # Seconds an object must age before it is processed
    new_log_cutoff: 7200
    unlink_log: false
    # Addresses whose traffic counts as internal (servicenet)
    service_ips: []
    lb_private_ips: []
    # Local directory `logroll ship` uploads from
    # log_dir: /var/log/swift/hourly

  account_stats:
    class_path: stats
    source_container: account_stats
    container_name: stats_rollups
    # Shipped objects are named YYYY/MM/DD/HH/<digest>.gz
    source_filename_pattern: '(?P<year>[0-9]{4})/(?P<month>[0-9]{2})/(?P<day>[0-9]{2})/(?P<hour>[0-9]{2})/.*\.gz$'
    # Files written by `logroll collect`
    log_dir: /var/log/logroll/account_stats
    log_filename_pattern: 'stats-(?P<year>[0-9]{4})(?P<month>[0-9]{2})(?P<day>[0-9]{2})(?P<hour>[0-9]{2})_.*$'
    devices: /srv/node
    # Skip devices that are not mount points
    mount_check: true

  container_stats:
    class_path: container_stats
    source_container: container_stats
    container_name: container_stats_rollups
    source_filename_pattern: '(?P<year>[0-9]{4})/(?P<month>[0-9]{2})/(?P<day>[0-9]{2})/(?P<hour>[0-9]{2})/.*\.gz$'
    log_dir: /var/log/logroll/container_stats
    log_filename_pattern: 'container-stats-(?P<year>[0-9]{4})(?P<month>[0-9]{2})(?P<day>[0-9]{2})(?P<hour>[0-9]{2})_.*$'
    devices: /srv/node
    metadata_keys: [color, owner]
    # Listed and recorded but not aggregated
    processable: false
"#
    .to_string()
}
