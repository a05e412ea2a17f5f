//! Progress, status, checkpoint and baseband-status message handling

use log::{debug, error, info};

use crate::util::{dict_get_bool, dict_get_path, dict_get_string, dict_get_uint};
use crate::RestoreError;

use super::RestoreContext;

/// Host-side progress buckets the device operations collapse into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStep {
    Prepare,
    UploadFs,
    VerifyFs,
    FlashFw,
    FlashBb,
    Fud,
}

const VERIFY_RESTORE: u32 = 14;
const FLASH_FIRMWARE: u32 = 18;
const UPDATE_BASEBAND: u32 = 19;
const REQUESTING_FUD_DATA: u32 = 36;
const UPDATE_IR_MCU_FIRMWARE: u32 = 51;
const UPDATE_ROSE: u32 = 65;
const UPDATE_VERIDIAN: u32 = 66;
const REQUESTING_EAN_DATA: u32 = 74;

pub(crate) fn operation_name(operation: u32) -> &'static str {
    match operation {
        11 => "Creating partition map",
        12 => "Creating filesystem",
        13 => "Restoring image",
        14 => "Verifying restore",
        15 => "Checking filesystems",
        16 => "Mounting filesystems",
        17 => "Fixing up /var",
        18 => "Flashing firmware",
        19 => "Updating baseband",
        20 => "Setting boot stage",
        21 => "Rebooting device",
        22 => "Shutdown device",
        23 => "Turning on accessory power",
        24 => "Clearing persistent boot-args",
        25 => "Modifying persistent boot-args",
        26 => "Installing root",
        27 => "Installing kernelcache",
        28 => "Waiting for NAND",
        29 => "Unmounting filesystems",
        30 => "Setting date and time on device",
        31 => "Executing iBEC to bootstrap update",
        32 => "Finalizing NAND epoch update",
        33 => "Checking for inappropriate bootable partitions",
        34 => "Creating factory restore marker",
        35 => "Loading firmware data to flash",
        36 => "Requesting FUD data",
        37 => "Removing activation record",
        38 => "Checking battery voltage",
        39 => "Waiting for battery to charge",
        40 => "Closing modem tickets",
        41 => "Migrating data",
        42 => "Wiping storage device",
        43 => "Sending Apple logo to device",
        44 => "Checking for uncollected logs",
        46 => "Clearing NVRAM",
        47 => "Updating gas gauge software",
        48 => "Preparing for baseband update",
        49 => "Booting the baseband",
        50 => "Creating system key bag",
        51 => "Updating IR MCU firmware",
        52 => "Resizing system partition",
        53 => "Collecting updater output",
        54 => "Pairing Stockholm",
        55 => "Updating Stockholm",
        56 => "Updating SWDHID",
        57 => "Certifying SEP",
        58 => "Updating NAND Firmware",
        59 => "Updating SE Firmware",
        60 => "Updating Savage",
        61 => "Installing DeviceTree",
        62 => "Certifying Savage",
        63 => "Submitting Provinfo",
        64 => "Certifying Yonkers",
        65 => "Updating Rose",
        66 => "Updating Veridian",
        67 => "Creating Protected Volume",
        68 => "Resizing Main Filesystem Partition",
        69 => "Creating Recovery OS Volume",
        70 => "Installing Recovery OS Files",
        71 => "Installing Recovery OS Image",
        74 => "Requesting EAN Data",
        77 => "Sealing System Volume",
        81 => "Updating AppleTCON",
        _ => "Unknown operation",
    }
}

/// Maps a device operation code onto the host progress scale, adjusting
/// for the pre-14 protocol where codes above 35 are off by one.
pub(crate) fn adapt_operation(operation: u32, protocol_version: u64) -> u32 {
    if protocol_version < 14 && operation > 35 {
        operation + 1
    } else {
        operation
    }
}

pub(crate) fn progress_step_for_operation(operation: u32) -> Option<RestoreStep> {
    match operation {
        VERIFY_RESTORE => Some(RestoreStep::VerifyFs),
        FLASH_FIRMWARE => Some(RestoreStep::FlashFw),
        UPDATE_BASEBAND | UPDATE_IR_MCU_FIRMWARE => Some(RestoreStep::FlashBb),
        REQUESTING_FUD_DATA => Some(RestoreStep::Fud),
        _ => None,
    }
}

pub(crate) fn handle_progress_msg(
    ctx: &mut RestoreContext,
    msg: &plist::Dictionary,
) -> Result<(), RestoreError> {
    let operation =
        dict_get_uint(msg, "Operation").ok_or(RestoreError::MalformedMessage("Operation"))? as u32;
    let progress =
        dict_get_uint(msg, "Progress").ok_or(RestoreError::MalformedMessage("Progress"))?;

    let adapted = adapt_operation(operation, ctx.protocol_version);

    if progress > 0 && progress <= 100 {
        if operation as i64 != ctx.last_operation {
            info!("{} ({operation})", operation_name(adapted));
        }
        match progress_step_for_operation(adapted) {
            Some(step) => ctx.report_progress(step, progress as f64 / 100.0),
            None => match adapted {
                UPDATE_ROSE | UPDATE_VERIDIAN | REQUESTING_EAN_DATA => {}
                _ => debug!("Unhandled progress operation {adapted} ({operation})"),
            },
        }
    } else {
        info!("{} ({operation})", operation_name(adapted));
    }
    ctx.last_operation = operation as i64;

    Ok(())
}

fn status_name(status: u64) -> Option<&'static str> {
    match status {
        0 => Some("Restore Finished"),
        6 => Some("Disk Failure"),
        14 => Some("Fail"),
        27 => Some("Failed to mount filesystems"),
        51 => Some("Failed to load SEP Firmware"),
        53 => Some("Failed to recover FDR data"),
        1015 => Some("X-Gold Baseband Update Failed. Defective Unit?"),
        u64::MAX => Some("Verification Error"),
        _ => None,
    }
}

pub(crate) struct StatusOutcome {
    pub finished: bool,
    pub failure: Option<RestoreError>,
}

pub(crate) fn handle_status_msg(msg: &plist::Dictionary) -> StatusOutcome {
    info!("Got status message");
    let status = dict_get_uint(msg, "Status").unwrap_or(0);
    match status_name(status) {
        Some(name) => info!("Status: {name}"),
        None => info!("Unhandled status message ({status})"),
    }

    let mut failure = None;
    if let Some(amr) = dict_get_uint(msg, "AMRError") {
        if amr != 0 {
            failure = Some(RestoreError::AmrError(-(amr as i64)));
        }
    }

    if let Some(log) = dict_get_string(msg, "Log") {
        info!("Log is available:\n{log}");
    }

    StatusOutcome {
        finished: status == 0,
        failure,
    }
}

pub(crate) fn handle_checkpoint_msg(msg: &plist::Dictionary) -> Result<(), RestoreError> {
    let id = dict_get_uint(msg, "CHECKPOINT_ID")
        .ok_or(RestoreError::MalformedMessage("CHECKPOINT_ID"))?;
    let result = dict_get_uint(msg, "CHECKPOINT_RESULT")
        .ok_or(RestoreError::MalformedMessage("CHECKPOINT_RESULT"))?;
    let complete = dict_get_bool(msg, "CHECKPOINT_COMPLETE");
    if complete {
        info!("Checkpoint {id} complete with code {result}");
    }
    Ok(())
}

pub(crate) fn handle_previous_restore_log_msg(msg: &plist::Dictionary) -> Result<(), RestoreError> {
    let log = dict_get_string(msg, "PreviousRestoreLog")
        .ok_or(RestoreError::MalformedMessage("PreviousRestoreLog"))?;
    info!("Previous Restore Log Received:\n{log}");
    Ok(())
}

pub(crate) fn handle_bb_update_status_msg(msg: &plist::Dictionary) -> Result<(), RestoreError> {
    if !dict_get_bool(msg, "Accepted") {
        error!("device didn't accept BasebandData");
        return Err(RestoreError::UnexpectedResponse);
    }

    let done = dict_get_path(msg, &["Output", "done"])
        .and_then(|v| v.as_boolean())
        .unwrap_or(false);
    if done {
        info!("Updating Baseband completed.");
        if let Some(imei) = dict_get_path(msg, &["Output", "provisioning", "IMEI"])
            .and_then(|v| v.as_string())
        {
            info!("Provisioning:");
            info!("IMEI:{imei}");
        }
    } else {
        info!("Updating Baseband in progress...");
    }
    Ok(())
}
