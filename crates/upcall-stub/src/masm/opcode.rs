#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Trap = 0,
    // Frame management
    Enter = 1,
    Leave = 2,
    Ret = 3,
    // Immediates and address arithmetic
    LoadImm64 = 20,
    AddImm64 = 21,
    // Register moves
    MoveReg = 40,
    MoveFp = 41,
    MoveGpToFp = 42,
    MoveFpToGp = 43,
    // Memory (TwoRegOneImm)
    LoadIndU64 = 60,
    StoreIndU64 = 61,
    LoadIndF64 = 62,
    StoreIndF64 = 63,
    LoadIndV128 = 64,
    StoreIndV128 = 65,
    LoadAcquireU64 = 66,
    // Calls and runtime primitives
    CallInd = 80,
    ResolveHandle = 81,
}

impl Opcode {
    #[must_use]
    pub const fn is_terminating(self) -> bool {
        matches!(self, Self::Trap | Self::Ret)
    }
}
