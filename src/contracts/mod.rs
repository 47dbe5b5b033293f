// Contracts Module - Public ABIs Only

pub mod erc20;
pub mod i_multicall3;

pub use erc20::Erc20;
pub use i_multicall3::IMulticall3;
