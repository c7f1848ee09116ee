pub mod actions;
pub mod cluster;
pub mod command;
pub mod inventory;
pub mod migration;
pub mod parser;
pub mod vm;

// the types every caller ends up needing
pub use actions::{VmAction, VmActions};
pub use cluster::{ClusterSource, CrmCli};
pub use command::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use inventory::{InventoryResolver, InventoryStore};
pub use migration::{JobStatus, MigrationCoordinator, MigrationHandle, MigrationJob, SettlementPolicy};
pub use vm::{CurrentNode, DefaultPlacement, VirtualMachineRecord, VmCreateRequest, VmId};
