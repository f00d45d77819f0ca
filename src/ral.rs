//! Register access for the LPC43xx USB0 device controller
//!
//! The register block and field modules follow the `ral-registers`
//! conventions, so the usual `read_reg!` / `write_reg!` / `modify_reg!`
//! macros work on them. Only the device-mode view of the registers the
//! driver touches is described here.

pub use ral_registers::{modify_reg, read_reg, write_reg};

/// Declares RAL field modules for one register
macro_rules! fields {
    ($($field:ident : $offset:expr, $width:expr;)*) => {
        $(
            pub mod $field {
                pub const offset: u32 = $offset;
                pub const mask: u32 = (((1u64 << $width) - 1) as u32) << offset;
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
        )*
    };
}

#[allow(non_snake_case, non_upper_case_globals)]
pub mod usb0 {
    use core::ops::Deref;
    use ral_registers::{RORegister, RWRegister};

    /// USB0 base address
    pub const USB0: usize = 0x4000_6000;

    /// Number of endpoints in each direction
    pub const ENDPOINTS: usize = 6;

    #[repr(C)]
    pub struct RegisterBlock {
        _capabilities: [u32; 0x140 / 4],
        pub USBCMD: RWRegister<u32>,
        pub USBSTS: RWRegister<u32>,
        pub USBINTR: RWRegister<u32>,
        pub FRINDEX: RORegister<u32>,
        _reserved0: u32,
        pub DEVICEADDR: RWRegister<u32>,
        pub ENDPOINTLISTADDR: RWRegister<u32>,
        pub TTCTRL: RWRegister<u32>,
        pub BURSTSIZE: RWRegister<u32>,
        pub TXFILLTUNING: RWRegister<u32>,
        _reserved1: [u32; 4],
        pub ENDPTNAK: RWRegister<u32>,
        pub ENDPTNAKEN: RWRegister<u32>,
        _reserved2: u32,
        pub PORTSC1: RWRegister<u32>,
        _reserved3: [u32; 7],
        pub OTGSC: RWRegister<u32>,
        pub USBMODE: RWRegister<u32>,
        pub ENDPTSETUPSTAT: RWRegister<u32>,
        pub ENDPTPRIME: RWRegister<u32>,
        pub ENDPTFLUSH: RWRegister<u32>,
        pub ENDPTSTAT: RORegister<u32>,
        pub ENDPTCOMPLETE: RWRegister<u32>,
        pub ENDPTCTRL: [RWRegister<u32>; ENDPOINTS],
    }

    const _: [(); 1] = [(); (core::mem::offset_of!(RegisterBlock, USBCMD) == 0x140) as usize];
    const _: [(); 1] = [(); (core::mem::offset_of!(RegisterBlock, PORTSC1) == 0x184) as usize];
    const _: [(); 1] = [(); (core::mem::offset_of!(RegisterBlock, ENDPTCTRL) == 0x1C0) as usize];

    /// An owned pointer to the USB0 register block
    pub struct Instance {
        addr: *const RegisterBlock,
    }

    impl Instance {
        /// # Safety
        ///
        /// `addr` must point to the USB0 register block, and the caller
        /// must not create another instance for the same block.
        pub const unsafe fn new(addr: *const ()) -> Self {
            Instance { addr: addr.cast() }
        }
    }

    impl Deref for Instance {
        type Target = RegisterBlock;
        fn deref(&self) -> &RegisterBlock {
            // Safety: validity guaranteed by the constructor.
            unsafe { &*self.addr }
        }
    }

    // Safety: the instance is the unique owner of the register block.
    unsafe impl Send for Instance {}

    pub mod USBCMD {
        fields! {
            RS: 0, 1;
            RST: 1, 1;
            SUTW: 13, 1;
            ATDTW: 14, 1;
            ITC: 16, 8;
        }
    }

    pub mod USBSTS {
        fields! {
            UI: 0, 1;
            UEI: 1, 1;
            PCI: 2, 1;
            URI: 6, 1;
            SRI: 7, 1;
            SLI: 8, 1;
        }
    }

    pub mod USBINTR {
        fields! {
            UE: 0, 1;
            UEE: 1, 1;
            PCE: 2, 1;
            URE: 6, 1;
            SLE: 8, 1;
        }
    }

    pub mod DEVICEADDR {
        fields! {
            USBADRA: 24, 1;
            USBADR: 25, 7;
        }
    }

    pub mod ENDPOINTLISTADDR {
        fields! {
            EPBASE: 11, 21;
        }
    }

    pub mod PORTSC1 {
        fields! {
            PR: 8, 1;
            PFSC: 24, 1;
            PSPD: 26, 2;
        }
    }

    pub mod USBMODE {
        fields! {
            CM: 0, 2;
            ES: 2, 1;
            SLOM: 3, 1;
            SDIS: 4, 1;
        }
        /// Device controller mode
        pub const CM_DEVICE: u32 = 2;
    }

    pub mod ENDPTSETUPSTAT {
        fields! {
            ENDPTSETUPSTAT: 0, 6;
        }
    }

    pub mod ENDPTPRIME {
        fields! {
            PERB: 0, 6;
            PETB: 16, 6;
        }
    }

    pub mod ENDPTFLUSH {
        fields! {
            FERB: 0, 6;
            FETB: 16, 6;
        }
    }

    pub mod ENDPTSTAT {
        fields! {
            ERBR: 0, 6;
            ETBR: 16, 6;
        }
    }

    pub mod ENDPTCOMPLETE {
        fields! {
            ERCE: 0, 6;
            ETCE: 16, 6;
        }
    }

    pub mod ENDPTNAK {
        fields! {
            EPRN: 0, 6;
            EPTN: 16, 6;
        }
    }

    pub mod ENDPTCTRL {
        fields! {
            RXS: 0, 1;
            RXT: 2, 2;
            RXR: 6, 1;
            RXE: 7, 1;
            TXS: 16, 1;
            TXT: 18, 2;
            TXR: 22, 1;
            TXE: 23, 1;
        }
    }
}

/// The RAL API wants a named register for every field access. The endpoint
/// control registers are an array, so wrap one of them into something the
/// macros accept.
pub mod endpoint_control {
    use super::usb0;
    use ral_registers::RWRegister;

    #[allow(non_snake_case)]
    pub struct EndptCtrl<'a> {
        pub ENDPTCTRL: &'a RWRegister<u32>,
    }

    #[allow(non_snake_case)]
    pub mod ENDPTCTRL {
        pub use super::usb0::ENDPTCTRL::*;
    }

    /// Returns `None` for endpoints the controller doesn't have
    pub fn register(usb: &usb0::RegisterBlock, endpoint: usize) -> Option<EndptCtrl<'_>> {
        usb.ENDPTCTRL
            .get(endpoint)
            .map(|reg| EndptCtrl { ENDPTCTRL: reg })
    }
}
