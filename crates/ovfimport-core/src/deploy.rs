//! Post-deploy steps on a freshly imported virtual machine.
//!
//! Steps run in a fixed order, each waiting for its remote operation to
//! finish before the next starts:
//!
//! 1. inject the OVF environment as `guestinfo.ovfEnv`
//! 2. mark as template
//! 3. power on (not for templates)
//! 4. wait for an IP address (only after power on)
//!
//! The first failing step stops the sequence. Applied steps are not undone.

use std::fmt;

use tracing::info;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::options::DeploymentOptions;
use crate::ovf::{OvfEnvironment, PlatformSection};
use crate::platform::{ManagedObjectRef, VmApi};

/// Extra-config key the guest reads its environment from.
pub const OVF_ENV_KEY: &str = "guestinfo.ovfEnv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    InjectOvfEnv,
    MarkAsTemplate,
    PowerOn,
    WaitForIp,
}

impl Step {
    pub const ALL: [Step; 4] = [
        Step::InjectOvfEnv,
        Step::MarkAsTemplate,
        Step::PowerOn,
        Step::WaitForIp,
    ];
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::InjectOvfEnv => "inject OVF environment",
            Step::MarkAsTemplate => "mark as template",
            Step::PowerOn => "power on",
            Step::WaitForIp => "wait for IP",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    Skipped,
}

/// What a deploy run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployReport {
    pub steps: Vec<(Step, StepOutcome)>,
    /// Address reported by the guest, if it was awaited.
    pub ip: Option<String>,
}

impl DeployReport {
    pub fn outcome(&self, step: Step) -> Option<StepOutcome> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, o)| *o)
    }

    pub fn applied(&self, step: Step) -> bool {
        self.outcome(step) == Some(StepOutcome::Applied)
    }
}

/// Runs the post-deploy steps against one platform.
pub struct Deployer<'a, V: ?Sized> {
    api: &'a V,
    locale: String,
    cancel: CancelToken,
}

impl<'a, V: VmApi + ?Sized> Deployer<'a, V> {
    pub fn new(api: &'a V, locale: impl Into<String>, cancel: CancelToken) -> Self {
        Self {
            api,
            locale: locale.into(),
            cancel,
        }
    }

    /// Run every step `options` asks for on `vm`.
    ///
    /// # Errors
    ///
    /// The failing step's error, unchanged. Later steps do not run.
    pub fn deploy(&self, vm: &ManagedObjectRef, options: &DeploymentOptions) -> Result<DeployReport> {
        let mut report = DeployReport::default();

        for step in Step::ALL {
            self.cancel.check()?;
            let outcome = self.run_step(step, vm, options, &mut report)?;
            report.steps.push((step, outcome));
        }

        Ok(report)
    }

    fn run_step(
        &self,
        step: Step,
        vm: &ManagedObjectRef,
        options: &DeploymentOptions,
        report: &mut DeployReport,
    ) -> Result<StepOutcome> {
        let wanted = match step {
            Step::InjectOvfEnv => options.inject_ovf_env,
            Step::MarkAsTemplate => options.mark_as_template,
            Step::PowerOn => options.power_on && !report.applied(Step::MarkAsTemplate),
            Step::WaitForIp => {
                options.wait_for_ip && !report.applied(Step::MarkAsTemplate) && report.applied(Step::PowerOn)
            }
        };
        if !wanted {
            return Ok(StepOutcome::Skipped);
        }

        info!(vm = %vm, "{}", step_message(step));
        match step {
            Step::InjectOvfEnv => {
                let env = self.environment(vm, options).to_xml()?;
                self.api.reconfigure(vm, &[(OVF_ENV_KEY.to_string(), env)])?;
            }
            Step::MarkAsTemplate => self.api.mark_as_template(vm)?,
            Step::PowerOn => self.api.power_on(vm)?,
            Step::WaitForIp => {
                let ip = self.api.wait_for_ip(vm, &self.cancel)?;
                info!(vm = %vm, ip = %ip, "received IP address");
                report.ip = Some(ip);
            }
        }
        Ok(StepOutcome::Applied)
    }

    /// The environment document for `vm`: platform identity plus the
    /// resolved property mapping.
    pub fn environment(&self, vm: &ManagedObjectRef, options: &DeploymentOptions) -> OvfEnvironment {
        let about = self.api.about();
        OvfEnvironment {
            esx_id: vm.value.clone(),
            platform: PlatformSection {
                kind: about.name,
                version: about.version,
                vendor: about.vendor,
                locale: self.locale.clone(),
            },
            properties: options
                .property_mapping
                .iter()
                .map(|p| (p.key.clone(), p.value.clone()))
                .collect(),
        }
    }
}

fn step_message(step: Step) -> &'static str {
    match step {
        Step::InjectOvfEnv => "injecting OVF environment",
        Step::MarkAsTemplate => "marking VM as template",
        Step::PowerOn => "powering on VM",
        Step::WaitForIp => "waiting for IP address",
    }
}
