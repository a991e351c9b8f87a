//! Collector configuration rendering
//!
//! Turns the aggregator endpoint and the user's filter/parser rules into the
//! two files stored in the collector's ConfigMap. Rendering is pure: no I/O.

use serde::Serialize;
use tera::{Context, Tera};
use tracing::debug;

use crate::collector::types::{Filter, Parser};
use crate::error::Result;

/// Where the ConfigMap is mounted inside the collector container
pub const CONFIG_MOUNT_PATH: &str = "/fluent-bit/etc/conf";
/// ConfigMap key of the main config file
pub const MAIN_CONFIG_KEY: &str = "fluent-bit.conf";
/// ConfigMap key of the parsers file
pub const PARSER_CONFIG_KEY: &str = "parsers.conf";
/// Host directory holding tail offsets; mounted at the same path in the container
pub const CHECKPOINT_DB_MOUNT_PATH: &str = "/var/lib/logs-collector/checkpoint-db";

const MAIN_TEMPLATE_NAME: &str = "fluent-bit.conf";
const PARSER_TEMPLATE_NAME: &str = "parsers.conf";

const MAIN_CONFIG_TEMPLATE: &str = r#"[SERVICE]
    Flush              1
    Log_Level          info
    Daemon             off
    Parsers_File       {{ parsers_file }}
    HTTP_Server        On
    HTTP_Listen        0.0.0.0
    HTTP_Port          {{ http_port }}
    Health_Check       On
    storage.path       {{ checkpoint_db_path }}/storage

[INPUT]
    Name               tail
    Tag                kube.*
    Path               /var/log/containers/*.log
    multiline.parser   docker, cri
    DB                 {{ checkpoint_db_path }}/tail.db
    Mem_Buf_Limit      5MB
    Skip_Long_Lines    On
    Refresh_Interval   10

[FILTER]
    Name               kubernetes
    Match              kube.*
    Kube_URL           https://kubernetes.default.svc:443
    Merge_Log          On
    Keep_Log           Off
    K8S-Logging.Parser On
    K8S-Logging.Exclude On
{% for rule in filters %}
[FILTER]
    Name               {{ rule.name }}
    Match              {{ rule.pattern }}
{%- for param in rule.params %}
    {{ param.key }} {{ param.value }}
{%- endfor %}
{% endfor %}
[OUTPUT]
    Name               forward
    Match              *
    Host               {{ aggregator_host }}
    Port               {{ aggregator_port }}
"#;

const PARSER_CONFIG_TEMPLATE: &str = r#"{% for parser in parsers -%}
[PARSER]
    Name   {{ parser.name }}
    Format {{ parser.format }}
{%- for param in parser.params %}
    {{ param.key }} {{ param.value }}
{%- endfor %}

{% endfor -%}
"#;

/// Produces the collector's main and parser config text
pub trait ConfigRenderer: Send + Sync {
    fn render_main_config(
        &self,
        http_port: u16,
        aggregator_host: &str,
        aggregator_port: u16,
        filters: &[Filter],
    ) -> Result<String>;

    fn render_parser_config(&self, parsers: &[Parser]) -> Result<String>;
}

#[derive(Serialize)]
struct ParamView<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct FilterView<'a> {
    name: &'a str,
    pattern: &'a str,
    params: Vec<ParamView<'a>>,
}

#[derive(Serialize)]
struct ParserView<'a> {
    name: &'a str,
    format: &'a str,
    params: Vec<ParamView<'a>>,
}

/// Fluent Bit config rendering backed by Tera templates
pub struct FluentBitRenderer {
    tera: Tera,
}

impl FluentBitRenderer {
    pub fn new() -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_template(MAIN_TEMPLATE_NAME, MAIN_CONFIG_TEMPLATE)?;
        tera.add_raw_template(PARSER_TEMPLATE_NAME, PARSER_CONFIG_TEMPLATE)?;
        Ok(Self { tera })
    }
}

/// Path the main config uses to find the parsers file
pub fn parser_config_path() -> String {
    format!("{}/{}", CONFIG_MOUNT_PATH, PARSER_CONFIG_KEY)
}

impl ConfigRenderer for FluentBitRenderer {
    fn render_main_config(
        &self,
        http_port: u16,
        aggregator_host: &str,
        aggregator_port: u16,
        filters: &[Filter],
    ) -> Result<String> {
        let filters: Vec<FilterView<'_>> = filters
            .iter()
            .map(|f| FilterView {
                name: &f.name,
                pattern: &f.match_pattern,
                params: f
                    .params
                    .iter()
                    .map(|p| ParamView {
                        key: &p.key,
                        value: &p.value,
                    })
                    .collect(),
            })
            .collect();

        let mut context = Context::new();
        context.insert("http_port", &http_port);
        context.insert("parsers_file", &parser_config_path());
        context.insert("checkpoint_db_path", CHECKPOINT_DB_MOUNT_PATH);
        context.insert("aggregator_host", aggregator_host);
        context.insert("aggregator_port", &aggregator_port);
        context.insert("filters", &filters);

        let rendered = self.tera.render(MAIN_TEMPLATE_NAME, &context)?;
        debug!("Generated collector config:\n{}", rendered);
        Ok(rendered)
    }

    fn render_parser_config(&self, parsers: &[Parser]) -> Result<String> {
        let parsers: Vec<ParserView<'_>> = parsers
            .iter()
            .map(|p| ParserView {
                name: &p.name,
                format: &p.format,
                params: p
                    .params
                    .iter()
                    .map(|param| ParamView {
                        key: &param.key,
                        value: &param.value,
                    })
                    .collect(),
            })
            .collect();

        let mut context = Context::new();
        context.insert("parsers", &parsers);

        let rendered = self.tera.render(PARSER_TEMPLATE_NAME, &context)?;
        debug!("Generated collector parser config:\n{}", rendered);
        Ok(rendered)
    }
}
