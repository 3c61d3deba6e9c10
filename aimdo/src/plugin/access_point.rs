/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use try_lock::TryLock;

use crate::error::AimdoError;

use super::DynAimdo;

/// The process wide context behind the C ABI.
///
/// The host framework serializes its calls, so the lock is never expected
/// to be contended. If it is, the call fails instead of waiting.
pub(crate) struct AimdoAccessPoint {
    inner: TryLock<Option<DynAimdo>>,
}

impl AimdoAccessPoint {
    pub(crate) const fn empty() -> Self {
        Self {
            inner: TryLock::new(None),
        }
    }

    pub(crate) fn set(&self, aimdo: DynAimdo) -> Result<(), AimdoError> {
        let mut lock_guard = self.inner.try_lock().ok_or(AimdoError::Busy)?;

        if lock_guard.is_some() {
            return Err(AimdoError::AlreadyInitialized);
        }
        *lock_guard = Some(aimdo);

        Ok(())
    }

    /// Takes the context out, so that it can be dropped without holding the lock
    pub(crate) fn unset(&self) -> Result<Option<DynAimdo>, AimdoError> {
        let mut lock_guard = self.inner.try_lock().ok_or(AimdoError::Busy)?;
        Ok(lock_guard.take())
    }

    pub(crate) fn with<R>(
        &self,
        f: impl FnOnce(&mut DynAimdo) -> Result<R, AimdoError>,
    ) -> Result<R, AimdoError> {
        let mut lock_guard = self.inner.try_lock().ok_or(AimdoError::Busy)?;
        let aimdo = lock_guard.as_mut().ok_or(AimdoError::NotInitialized)?;
        f(aimdo)
    }
}
