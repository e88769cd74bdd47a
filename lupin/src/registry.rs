use crate::lupin_common::*;

/// Where a dataset lives and which batches the first model sees
#[derive(Debug, PartialEq, Eq)]
pub struct DatasetDescriptor {
    pub name: &'static str,
    pub batch_key: &'static str,
    pub cell_type_key: &'static str,
    pub source: &'static [&'static str],
}

impl DatasetDescriptor {
    pub fn is_source(&self, batch: &str) -> bool {
        self.source.contains(&batch)
    }
}

static DATASETS: &[(&str, DatasetDescriptor)] = &[
    (
        "pancreas",
        DatasetDescriptor {
            name: "pancreas",
            batch_key: "study",
            cell_type_key: "cell_type",
            source: &["Pancreas CelSeq", "Pancreas inDrop", "Pancreas Fluidigm C1"],
        },
    ),
    (
        "toy",
        DatasetDescriptor {
            name: "toy",
            batch_key: "batch",
            cell_type_key: "celltype",
            source: &[
                "Batch1", "Batch2", "Batch3", "Batch4", "Batch5", "Batch6", "Batch7",
            ],
        },
    ),
    (
        "pbmc",
        DatasetDescriptor {
            name: "pbmc_subset",
            batch_key: "study",
            cell_type_key: "cell_type",
            source: &["inDrops", "Drop-seq"],
        },
    ),
];

pub fn lookup(key: &str) -> Result<&'static DatasetDescriptor, LupinError> {
    DATASETS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, d)| d)
        .ok_or_else(|| LupinError::DatasetNotFound(key.to_string()))
}

pub fn keys() -> Vec<&'static str> {
    DATASETS.iter().map(|(k, _)| *k).collect()
}
