pub mod compiler;
pub mod interval;
pub mod snapshot;

pub use compiler::{
    ArtifactId, Column, ColumnType, CompiledArtifacts, Dashboard, Datasource, Graph, SeriesTable,
    TimeSeriesCompiler,
};
pub use interval::{build_interval_series, interval_windows, IntervalQuery, IntervalRow, IntervalTable};
pub use snapshot::{
    read_snapshots, MalformedLinePolicy, SkipReason, SkippedFile, SnapshotQuery, SnapshotRead,
    SnapshotRow, SnapshotTable,
};

use std::str::FromStr;

use crate::error::{Error, Result};
use crate::metrics::{MetricConfig, RevertRateConfig, ThresholdConfig};

/// Which snapshot columns to sum, by position in the tab-separated header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    /// Registrations and productive editors.
    Prod,
    /// Revision, revert and editor counts.
    Revert,
    Custom(Vec<usize>),
}

impl DataType {
    pub fn field_indices(&self) -> Vec<usize> {
        match self {
            DataType::Prod => vec![1, 2],
            DataType::Revert => vec![1, 2, 3, 4],
            DataType::Custom(indices) => indices.clone(),
        }
    }

    /// The metric an interval series of this type is built from. Custom
    /// column selections only exist in snapshot files.
    pub fn interval_metric(&self) -> Option<MetricConfig> {
        match self {
            DataType::Prod => Some(MetricConfig::Threshold(ThresholdConfig::default())),
            DataType::Revert => Some(MetricConfig::RevertRate(RevertRateConfig::default())),
            DataType::Custom(_) => None,
        }
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prod" => Ok(DataType::Prod),
            "revert" => Ok(DataType::Revert),
            other => Err(Error::Config(format!(
                "unknown data type '{other}' (expected prod or revert)"
            ))),
        }
    }
}

/// Parse a comma-separated list of column indices, e.g. `1,2,5`.
pub fn parse_field_indices(s: &str) -> Result<Vec<usize>> {
    let indices = s
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<usize>()
                .map_err(|_| Error::Config(format!("invalid field index '{part}'")))
        })
        .collect::<Result<Vec<_>>>()?;
    if indices.is_empty() {
        return Err(Error::Config("no field indices given".into()));
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_indices() {
        assert_eq!("prod".parse::<DataType>().unwrap().field_indices(), vec![1, 2]);
        assert_eq!(
            "Revert".parse::<DataType>().unwrap().field_indices(),
            vec![1, 2, 3, 4]
        );
        assert!(matches!("bytes".parse::<DataType>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_interval_metric_per_data_type() {
        assert!(matches!(
            DataType::Prod.interval_metric(),
            Some(MetricConfig::Threshold(_))
        ));
        assert!(matches!(
            DataType::Revert.interval_metric(),
            Some(MetricConfig::RevertRate(_))
        ));
        assert_eq!(DataType::Custom(vec![1]).interval_metric(), None);
    }

    #[test]
    fn test_parse_field_indices() {
        assert_eq!(parse_field_indices("1, 3,5").unwrap(), vec![1, 3, 5]);
        assert!(parse_field_indices("1,x").is_err());
        assert!(parse_field_indices(" , ").is_err());
    }
}
