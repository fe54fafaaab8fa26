use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The transaction kinds a NEO legacy node reports in `getblock` output.
///
/// Only the pre-2.0 set is known. `StateTransaction` and any other newer kind fail to parse,
/// which stops ingestion at that block rather than storing it with an unknown type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TxType {
    Miner,
    Issue,
    Claim,
    Enrollment,
    Register,
    Contract,
    Publish,
    Invocation,
}

impl TxType {
    pub const ALL: [TxType; 8] = [
        TxType::Miner,
        TxType::Issue,
        TxType::Claim,
        TxType::Enrollment,
        TxType::Register,
        TxType::Contract,
        TxType::Publish,
        TxType::Invocation,
    ];
}

impl std::fmt::Display for TxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxType::Miner => write!(f, "MinerTransaction"),
            TxType::Issue => write!(f, "IssueTransaction"),
            TxType::Claim => write!(f, "ClaimTransaction"),
            TxType::Enrollment => write!(f, "EnrollmentTransaction"),
            TxType::Register => write!(f, "RegisterTransaction"),
            TxType::Contract => write!(f, "ContractTransaction"),
            TxType::Publish => write!(f, "PublishTransaction"),
            TxType::Invocation => write!(f, "InvocationTransaction"),
        }
    }
}

impl FromStr for TxType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MinerTransaction" => Ok(TxType::Miner),
            "IssueTransaction" => Ok(TxType::Issue),
            "ClaimTransaction" => Ok(TxType::Claim),
            "EnrollmentTransaction" => Ok(TxType::Enrollment),
            "RegisterTransaction" => Ok(TxType::Register),
            "ContractTransaction" => Ok(TxType::Contract),
            "PublishTransaction" => Ok(TxType::Publish),
            "InvocationTransaction" => Ok(TxType::Invocation),
            _ => Err(format!("Unknown transaction type: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_known_type_back_from_its_display_form() {
        for tx_type in TxType::ALL {
            assert_eq!(tx_type.to_string().parse::<TxType>(), Ok(tx_type));
        }
    }

    #[test]
    fn rejects_unknown_type() {
        assert!("StateTransaction".parse::<TxType>().is_err());
        assert!("minertransaction".parse::<TxType>().is_err());
    }
}
