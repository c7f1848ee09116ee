/*
* Cluster Tooling Bridge
* ----------------------
* @project: ha-vm-manager
*
* Everything we know about the cluster comes out of three command-line tools:
*
*   vm-mgr   - VM lifecycle and snapshots (the site-specific wrapper)
*   crm      - crmsh, for locate / move / restart / configure show / status
*   crm_mon  - Pacemaker's monitor, asked for XML so roles are attributes
*
* ClusterSource is the seam: it hands back raw text and leaves the parsing to
* core::parser. CrmCli is the real implementation, anything else is a fake in
* tests. Queries fail with SourceUnavailable, actions fail with CommandFailed
* when the tool ran but said no.
*/

use async_trait::async_trait;
use tracing::{debug, error, instrument};

use crate::config::ClusterSettings;
use crate::core::command::{CommandRunner, SystemCommandRunner};
use crate::core::vm::VmCreateRequest;
use crate::errors::{ClusterError, ClusterResult};

#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// Newline-delimited VM names.
    async fn vm_list(&self) -> ClusterResult<String>;

    /// `resource <vm> is running on: <node>`
    async fn locate(&self, vm: &str) -> ClusterResult<String>;

    /// crm_mon XML covering at least the `<resource id="vm">` element.
    async fn resource_status(&self, vm: &str) -> ClusterResult<String>;

    /// Full `crm configure show` dump.
    async fn configuration(&self) -> ClusterResult<String>;

    /// Node section of `crm status`.
    async fn node_status(&self) -> ClusterResult<String>;

    /// Asks Pacemaker to relocate `vm`. Returns once the request is accepted,
    /// not when the VM has moved.
    async fn move_resource(&self, vm: &str, node: &str) -> ClusterResult<()>;

    async fn restart_resource(&self, vm: &str) -> ClusterResult<()>;

    /// `vm-mgr <action> -n <vm> <args..>`
    async fn vm_mgr(&self, action: &str, vm: &str, args: &[String]) -> ClusterResult<()>;

    async fn list_snapshots(&self, vm: &str) -> ClusterResult<String>;

    async fn create_vm(&self, request: &VmCreateRequest) -> ClusterResult<()>;
}

/// [`ClusterSource`] that shells out to the crmsh / pacemaker / vm-mgr tools.
pub struct CrmCli<R = SystemCommandRunner> {
    runner: R,
    vm_mgr: String,
    crm: String,
    crm_mon: String,
}

impl CrmCli<SystemCommandRunner> {
    pub fn from_settings(settings: &ClusterSettings) -> Self {
        let runner = SystemCommandRunner::new(settings.command_timeout()).with_sudo(settings.use_sudo);
        Self::with_runner(runner, settings)
    }
}

impl<R: CommandRunner> CrmCli<R> {
    pub fn with_runner(runner: R, settings: &ClusterSettings) -> Self {
        Self {
            runner,
            vm_mgr: settings.vm_mgr_bin.clone(),
            crm: settings.crm_bin.clone(),
            crm_mon: settings.crm_mon_bin.clone(),
        }
    }

    async fn query(&self, program: &str, args: Vec<String>) -> ClusterResult<String> {
        let label = command_line(program, &args);
        let output = self
            .runner
            .run(program, &args)
            .await
            .map_err(|e| ClusterError::source_unavailable(&label, e))?;

        if !output.is_success() {
            debug!(command = %label, code = ?output.code, stderr = %output.stderr.trim(), "query failed");
            return Err(ClusterError::source_unavailable(
                label,
                format!("exit status {:?}: {}", output.code, output.stderr.trim()),
            ));
        }
        Ok(output.stdout)
    }

    async fn action(&self, program: &str, args: Vec<String>) -> ClusterResult<()> {
        let label = command_line(program, &args);
        let output = self
            .runner
            .run(program, &args)
            .await
            .map_err(|e| ClusterError::source_unavailable(&label, e))?;

        if !output.is_success() {
            error!(command = %label, code = ?output.code, stderr = %output.stderr.trim(), "cluster action failed");
            return Err(ClusterError::CommandFailed {
                command: label,
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<R: CommandRunner> ClusterSource for CrmCli<R> {
    async fn vm_list(&self) -> ClusterResult<String> {
        self.query(&self.vm_mgr, args(["list"])).await
    }

    async fn locate(&self, vm: &str) -> ClusterResult<String> {
        self.query(&self.crm, args(["resource", "locate", vm])).await
    }

    async fn resource_status(&self, vm: &str) -> ClusterResult<String> {
        let filter = format!("--resource={}", vm);
        self.query(&self.crm_mon, args(["--output-as", "xml", filter.as_str()]))
            .await
    }

    async fn configuration(&self) -> ClusterResult<String> {
        self.query(&self.crm, args(["configure", "show"])).await
    }

    async fn node_status(&self) -> ClusterResult<String> {
        self.query(&self.crm, args(["status", "--exclude=all", "--include=nodes"]))
            .await
    }

    #[instrument(skip(self))]
    async fn move_resource(&self, vm: &str, node: &str) -> ClusterResult<()> {
        self.action(&self.crm, args(["resource", "move", vm, node])).await
    }

    #[instrument(skip(self))]
    async fn restart_resource(&self, vm: &str) -> ClusterResult<()> {
        self.action(&self.crm, args(["resource", "restart", vm])).await
    }

    #[instrument(skip(self))]
    async fn vm_mgr(&self, action: &str, vm: &str, extra: &[String]) -> ClusterResult<()> {
        let mut argv = args([action, "-n", vm]);
        argv.extend_from_slice(extra);
        self.action(&self.vm_mgr, argv).await
    }

    async fn list_snapshots(&self, vm: &str) -> ClusterResult<String> {
        self.query(&self.vm_mgr, args(["list_snapshots", "-n", vm])).await
    }

    #[instrument(skip(self, request), fields(vm = %request.name))]
    async fn create_vm(&self, request: &VmCreateRequest) -> ClusterResult<()> {
        self.action(&self.vm_mgr, create_args(request)).await
    }
}

/// Arguments for `vm-mgr create`, in the order the tool documents them.
pub fn create_args(request: &VmCreateRequest) -> Vec<String> {
    let mut argv = args([
        "create",
        "-p",
        "--name",
        request.name.as_str(),
        "--image",
        request.image_path.as_str(),
        "--xml",
        request.xml_path.as_str(),
    ]);

    if let Some(user) = &request.migration_user {
        argv.push("--enable-live-migration".to_string());
        argv.push("--migration-user".to_string());
        argv.push(user.clone());
    }

    // pin wins if both slipped through validation
    if let Some(host) = &request.pinned_host {
        argv.push("--pinned-host".to_string());
        argv.push(host.clone());
    } else if let Some(host) = &request.preferred_host {
        argv.push("--preferred-host".to_string());
        argv.push(host.clone());
    }

    argv
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn command_line(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}
