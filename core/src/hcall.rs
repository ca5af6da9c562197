//! Hypercall ABI for registering ESN structures with the hypervisor.

use crate::error::HcallError;

pub const H_SUCCESS: i64 = 0;
pub const H_FUNCTION: i64 = -2;
pub const H_PARAMETER: i64 = -4;
pub const H_RESOURCE: i64 = -16;
pub const H_P2: i64 = -55;

pub const H_REGISTER_VPA: u64 = 0xdc;
pub const H_REG_SNS: u64 = 0x41c;

/// `REGISTER_SNS` with this address deregisters the region.
pub const SNS_DEREGISTER: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcallMessage {
    RegisterSns { gpa: u64, len: u64 },
    RegisterVpa { vcpu: u32, gpa: u64 },
}

impl HcallMessage {
    pub fn opcode(&self) -> u64 {
        match self {
            HcallMessage::RegisterSns { .. } => H_REG_SNS,
            HcallMessage::RegisterVpa { .. } => H_REGISTER_VPA,
        }
    }

    pub fn args(&self) -> [u64; 2] {
        match *self {
            HcallMessage::RegisterSns { gpa, len } => [gpa, len],
            HcallMessage::RegisterVpa { vcpu, gpa } => [u64::from(vcpu), gpa],
        }
    }
}

/// Raw `(status, return value)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcallReturn {
    pub status: i64,
    pub value: u64,
}

impl HcallReturn {
    pub fn success(value: u64) -> Self {
        Self {
            status: H_SUCCESS,
            value,
        }
    }

    pub fn failure(status: i64) -> Self {
        Self { status, value: 0 }
    }

    pub fn into_result(self) -> Result<u64, HcallError> {
        match self.status {
            H_SUCCESS => Ok(self.value),
            H_FUNCTION => Err(HcallError::Unsupported),
            status => Err(HcallError::HypervisorRejected(status)),
        }
    }
}

/// The hypervisor side of the call gate.
pub trait Hypercall: Send + Sync {
    fn hcall(&self, msg: &HcallMessage) -> HcallReturn;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_mapping() {
        assert_eq!(HcallReturn::success(7).into_result(), Ok(7));
        assert_eq!(
            HcallReturn::failure(H_FUNCTION).into_result(),
            Err(HcallError::Unsupported)
        );
        assert_eq!(
            HcallReturn::failure(H_PARAMETER).into_result(),
            Err(HcallError::HypervisorRejected(H_PARAMETER))
        );
    }

    #[test]
    fn test_message_encoding() {
        let msg = HcallMessage::RegisterSns {
            gpa: SNS_DEREGISTER,
            len: 4096,
        };
        assert_eq!(msg.opcode(), H_REG_SNS);
        assert_eq!(msg.args(), [u64::MAX, 4096]);
        let msg = HcallMessage::RegisterVpa { vcpu: 3, gpa: 0x200 };
        assert_eq!(msg.opcode(), H_REGISTER_VPA);
        assert_eq!(msg.args(), [3, 0x200]);
    }
}
