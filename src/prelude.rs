// SPDX-License-Identifier: MPL-2.0

pub(crate) use alloc::collections::BTreeMap;
pub(crate) use alloc::string::{String, ToString};
pub(crate) use alloc::sync::{Arc, Weak};
pub(crate) use alloc::vec;
pub(crate) use alloc::vec::Vec;

pub(crate) use align_ext::AlignExt;
pub(crate) use bitflags::bitflags;
pub(crate) use int_to_c_enum::TryFromInt;
pub(crate) use spin::{Mutex, RwLock};
pub(crate) use static_assertions::const_assert;
pub(crate) use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub(crate) use crate::error::{Errno, Error, Result};
pub(crate) use crate::utils::Dirty;
pub(crate) use crate::{return_errno, return_errno_with_message};
