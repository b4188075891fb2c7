use paste::paste;

/// `struct pt_regs` for x86_64, in kernel layout.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PtRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub bp: u64,
    pub bx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub ax: u64,
    pub cx: u64,
    pub dx: u64,
    pub si: u64,
    pub di: u64,
    pub orig_ax: u64,
    pub ip: u64,
    pub cs: u64,
    pub flags: u64,
    pub sp: u64,
    pub ss: u64,
}

macro_rules! syscall_args {
    ($($n: literal => $r: ident),*) => {
        paste! {
            impl PtRegs {
                $(
                    pub fn [<arg $n>](&self) -> u64 {
                        self.$r
                    }

                    pub fn [<set_arg $n>](&mut self, v: u64) {
                        self.$r = v;
                    }
                )*
            }
        }
    };
}

syscall_args!(0 => di, 1 => si, 2 => dx, 3 => r10, 4 => r8, 5 => r9);
