pub mod fat;
pub mod partitioner;
pub mod registration;

pub use fat::{FatFormatter, FatLayout, FatType, VolumeMetadata};
pub use partitioner::{build_partition_table, write_partition_table, MbrEntry, PartitionTable};
pub use registration::{builtin_registry, list_available_formatters, register_builtin_formatters};
