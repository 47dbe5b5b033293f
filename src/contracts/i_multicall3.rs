use ethers::prelude::abigen;

// Multicall3 is deployed at the same address on most EVM chains
// (0xcA11bde05977b3631167028862bE2a173976CA11). aggregate3 is encoded by hand in
// multicall.rs; only the view helpers are bound here.
abigen!(
    IMulticall3,
    r#"[
        function getEthBalance(address addr) external view returns (uint256 balance)
        function getBlockNumber() external view returns (uint256 blockNumber)
    ]"#
);
