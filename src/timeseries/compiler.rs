use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::snapshot::SnapshotTable;
use crate::error::{Error, Result};
use crate::report::render::csv_escape;

const DATASOURCE_DIR: &str = "datasources";
const GRAPH_DIR: &str = "graphs";
const DASHBOARD_DIR: &str = "dashboards";

/// Identifier of a written artifact: a lowercase slug of its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// `"Editor Activation (daily)"` becomes `editor_activation_daily`.
    pub fn from_name(name: &str) -> Result<Self> {
        let mut slug = String::with_capacity(name.len());
        for c in name.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.is_empty() && !slug.ends_with('_') {
                slug.push('_');
            }
        }
        let slug = slug.trim_end_matches('_').to_string();
        if slug.is_empty() {
            return Err(Error::Config(format!(
                "artifact name '{name}' has no usable characters"
            )));
        }
        Ok(Self(slug))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Date,
    Timestamp,
    Int,
    Float,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
}

impl Column {
    pub fn new(id: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// A table a datasource can be built from: a key column (date or timestamp)
/// followed by plottable value columns.
pub trait SeriesTable {
    fn key_column(&self) -> Column;

    fn value_columns(&self) -> Vec<Column>;

    fn row_count(&self) -> usize;

    /// Each row as CSV fields, key first. Missing values are empty strings.
    fn csv_records(&self) -> Vec<Vec<String>>;

    /// Rows as embedded in the datasource JSON.
    fn rows_json(&self) -> Result<serde_json::Value>;
}

impl SeriesTable for SnapshotTable {
    fn key_column(&self) -> Column {
        Column::new("date", ColumnType::Date)
    }

    fn value_columns(&self) -> Vec<Column> {
        self.columns
            .iter()
            .map(|c| Column::new(c.as_str(), ColumnType::Int))
            .collect()
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn csv_records(&self) -> Vec<Vec<String>> {
        self.rows
            .iter()
            .map(|row| {
                let mut record = vec![row.date.format("%Y-%m-%d").to_string()];
                record.extend(row.values.iter().map(i64::to_string));
                record
            })
            .collect()
    }

    fn rows_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.rows)?)
    }
}

/// Written once; `columns` starts with the key column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Datasource {
    pub id: ArtifactId,
    pub name: String,
    /// CSV rendition, relative to the output directory.
    pub url: String,
    pub columns: Vec<Column>,
    pub rows: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Series {
    pub datasource_id: ArtifactId,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Graph {
    pub id: ArtifactId,
    pub name: String,
    pub title: String,
    pub series: Vec<Series>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tab {
    pub name: String,
    pub graph_ids: Vec<ArtifactId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dashboard {
    pub id: ArtifactId,
    pub name: String,
    pub title: String,
    pub tabs: Vec<Tab>,
}

#[derive(Debug, Clone)]
pub struct CompiledArtifacts {
    pub datasource: Datasource,
    pub graph: Graph,
    pub dashboard: Dashboard,
}

/// Turns series tables into linked datasource, graph and dashboard files.
///
/// Each build step writes its artifact before returning. A graph may only
/// name a datasource this compiler already wrote, and a dashboard only graphs
/// it already wrote. Nothing is written twice.
pub struct TimeSeriesCompiler {
    out_dir: PathBuf,
    /// Written datasources and their plottable columns.
    datasources: HashMap<ArtifactId, Vec<String>>,
    graphs: HashSet<ArtifactId>,
    dashboards: HashSet<ArtifactId>,
}

impl TimeSeriesCompiler {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            datasources: HashMap::new(),
            graphs: HashSet::new(),
            dashboards: HashSet::new(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Write `datasources/<id>.json` and `datasources/<id>.csv`. Both are
    /// rendered before either file is written.
    pub fn build_datasource<T: SeriesTable + ?Sized>(
        &mut self,
        name: &str,
        table: &T,
    ) -> Result<Datasource> {
        let id = ArtifactId::from_name(name)?;
        if self.datasources.contains_key(&id) {
            return Err(Error::DuplicateArtifact(format!("datasource {id}")));
        }
        let values = table.value_columns();
        if values.is_empty() {
            return Err(Error::Config(format!(
                "datasource '{name}' has no columns"
            )));
        }
        let plottable: Vec<String> = values.iter().map(|c| c.id.clone()).collect();

        let mut columns = vec![table.key_column()];
        columns.extend(values);

        let csv_rel = format!("{DATASOURCE_DIR}/{id}.csv");
        let csv = datasource_csv(&columns, table);
        let datasource = Datasource {
            id: id.clone(),
            name: name.to_string(),
            url: csv_rel.clone(),
            columns,
            rows: table.rows_json()?,
        };
        let json = serde_json::to_string_pretty(&datasource)?;

        self.write_file(&format!("{DATASOURCE_DIR}/{id}.json"), &json)?;
        self.write_file(&csv_rel, &csv)?;
        log::info!(
            "wrote datasource {id} ({} rows, {} columns)",
            table.row_count(),
            plottable.len()
        );

        self.datasources.insert(id, plottable);
        Ok(datasource)
    }

    /// Write `graphs/<id>.json` with one series per field, all plotting the
    /// same datasource.
    pub fn build_graph(
        &mut self,
        name: &str,
        title: &str,
        datasource_id: &ArtifactId,
        fields: &[String],
    ) -> Result<Graph> {
        let columns = self.datasources.get(datasource_id).ok_or_else(|| {
            Error::Sequencing(format!(
                "graph '{name}' references datasource {datasource_id}, which has not been written"
            ))
        })?;
        if fields.is_empty() {
            return Err(Error::Config(format!("graph '{name}' has no fields")));
        }
        if let Some(unknown) = fields.iter().find(|f| !columns.contains(*f)) {
            return Err(Error::Config(format!(
                "datasource {datasource_id} has no column '{unknown}'"
            )));
        }

        let id = ArtifactId::from_name(name)?;
        if self.graphs.contains(&id) {
            return Err(Error::DuplicateArtifact(format!("graph {id}")));
        }
        let graph = Graph {
            id: id.clone(),
            name: name.to_string(),
            title: title.to_string(),
            series: fields
                .iter()
                .map(|field| Series {
                    datasource_id: datasource_id.clone(),
                    field: field.clone(),
                })
                .collect(),
        };
        self.write_json(GRAPH_DIR, &id, &graph)?;
        log::info!("wrote graph {id} ({} series)", graph.series.len());

        self.graphs.insert(id);
        Ok(graph)
    }

    /// Write `dashboards/<id>.json` with a single tab listing `graph_ids` in order.
    pub fn build_dashboard(
        &mut self,
        name: &str,
        title: &str,
        tab_name: &str,
        graph_ids: &[ArtifactId],
    ) -> Result<Dashboard> {
        if graph_ids.is_empty() {
            return Err(Error::Config(format!("dashboard '{name}' has no graphs")));
        }
        if let Some(missing) = graph_ids.iter().find(|id| !self.graphs.contains(*id)) {
            return Err(Error::Sequencing(format!(
                "dashboard '{name}' references graph {missing}, which has not been written"
            )));
        }

        let id = ArtifactId::from_name(name)?;
        if self.dashboards.contains(&id) {
            return Err(Error::DuplicateArtifact(format!("dashboard {id}")));
        }
        let dashboard = Dashboard {
            id: id.clone(),
            name: name.to_string(),
            title: title.to_string(),
            tabs: vec![Tab {
                name: tab_name.to_string(),
                graph_ids: graph_ids.to_vec(),
            }],
        };
        self.write_json(DASHBOARD_DIR, &id, &dashboard)?;
        log::info!("wrote dashboard {id}");

        self.dashboards.insert(id);
        Ok(dashboard)
    }

    /// Datasource, one graph over every value column, and a one-tab dashboard.
    pub fn compile<T: SeriesTable + ?Sized>(
        &mut self,
        name: &str,
        title: &str,
        graph_title: &str,
        tab_name: &str,
        table: &T,
    ) -> Result<CompiledArtifacts> {
        let datasource = self.build_datasource(name, table)?;
        let fields: Vec<String> = datasource.columns[1..].iter().map(|c| c.id.clone()).collect();
        let graph = self.build_graph(name, graph_title, &datasource.id, &fields)?;
        let dashboard = self.build_dashboard(name, title, tab_name, &[graph.id.clone()])?;
        Ok(CompiledArtifacts {
            datasource,
            graph,
            dashboard,
        })
    }

    fn write_json<T: Serialize>(&self, dir: &str, id: &ArtifactId, artifact: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(artifact)?;
        self.write_file(&format!("{dir}/{id}.json"), &json)
    }

    fn write_file(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.out_dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        log::debug!("wrote {}", path.display());
        Ok(())
    }
}

fn datasource_csv<T: SeriesTable + ?Sized>(columns: &[Column], table: &T) -> String {
    let header: Vec<String> = columns.iter().map(|c| csv_escape(&c.id)).collect();
    let mut out = header.join(",");
    out.push('\n');
    for record in table.csv_records() {
        let fields: Vec<String> = record.iter().map(|f| csv_escape(f)).collect();
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}
