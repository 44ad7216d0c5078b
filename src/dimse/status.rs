//! DIMSE status codes returned by the service class providers.
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>

use crate::types::US;

pub const SUCCESS: US = 0x0000;
pub const PENDING: US = 0xFF00;
pub const CANCEL: US = 0xFE00;

pub const PROCESSING_FAILURE: US = 0x0110;
pub const DUPLICATE_SOP_INSTANCE: US = 0x0111;
pub const SOP_CLASS_NOT_SUPPORTED: US = 0x0122;
pub const REFUSED_NOT_AUTHORIZED: US = 0x0124;
pub const UNRECOGNIZED_OPERATION: US = 0x0211;

pub const OUT_OF_RESOURCES: US = 0xA700;
pub const UNABLE_TO_PERFORM_SUBOPERATIONS: US = 0xA702;
pub const MOVE_DESTINATION_UNKNOWN: US = 0xA801;
pub const IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS: US = 0xA900;
pub const SUB_OPERATIONS_ONE_OR_MORE_FAILURES: US = 0xB000;
pub const UNABLE_TO_PROCESS: US = 0xC000;
