//! Account and contract-code records inside a state slice.
//!
//! Key scheme (65-byte keys):
//!
//! - `0x01 | address | .. | 0x00` - account `{balance, nonce}`, both LE64
//! - `0x01 | address | .. | 0x01` - code header `{present, length}`
//! - `0x01 | address | .. | 0x02` - implicit contract-creation nonce
//! - `0x02 | address | slot`      - contract storage word
//! - `0x02 | address | .. | index BE64` - code data block
//!
//! Missing keys read as zero, so a fresh address is an account with zero
//! balance and nonce.

use crate::storage::slice::{Key, Slice, Value, DATA_LEN};
use crate::storage::StorageError;
use crate::types::address::Address;

/// Key tag for account-level records.
pub const TAG_ACCOUNT: u8 = 1;

/// Key tag for contract storage and code blocks.
pub const TAG_CONTRACT: u8 = 2;

/// Sub-key of the contract code header under [`TAG_ACCOUNT`].
pub const SUBKEY_CODE_HEADER: u8 = 1;

/// Sub-key of the implicit creation nonce under [`TAG_ACCOUNT`].
pub const SUBKEY_CREATE_NONCE: u8 = 2;

/// Balance and transaction counter of one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub balance: u64,
    pub nonce: u64,
}

fn tagged_key(tag: u8, address: &Address, subkey: u8) -> Key {
    let mut key = [0u8; 65];
    key[0] = tag;
    key[1..33].copy_from_slice(address.as_slice());
    key[64] = subkey;
    key
}

/// Key of the account record.
pub fn account_key(address: &Address) -> Key {
    tagged_key(TAG_ACCOUNT, address, 0)
}

/// Key of the contract code header.
pub fn code_header_key(address: &Address) -> Key {
    tagged_key(TAG_ACCOUNT, address, SUBKEY_CODE_HEADER)
}

/// Key of the implicit contract-creation nonce.
pub fn create_nonce_key(address: &Address) -> Key {
    tagged_key(TAG_ACCOUNT, address, SUBKEY_CREATE_NONCE)
}

/// Key of code data block `index`.
pub fn code_block_key(address: &Address, index: u64) -> Key {
    let mut key = tagged_key(TAG_CONTRACT, address, 0);
    key[57..65].copy_from_slice(&index.to_be_bytes());
    key
}

/// Key of a contract storage slot.
pub fn storage_slot_key(address: &Address, slot: &[u8; 32]) -> Key {
    let mut key = [0u8; 65];
    key[0] = TAG_CONTRACT;
    key[1..33].copy_from_slice(address.as_slice());
    key[33..65].copy_from_slice(slot);
    key
}

/// Reads an account; missing accounts are zero-valued.
pub fn get_account_info(slice: &Slice, address: &Address) -> AccountInfo {
    let val = slice.read(&account_key(address));
    AccountInfo {
        balance: u64::from_le_bytes(val[..8].try_into().unwrap()),
        nonce: u64::from_le_bytes(val[8..16].try_into().unwrap()),
    }
}

/// Writes an account record.
pub fn set_account_info(
    slice: &Slice,
    address: &Address,
    info: AccountInfo,
) -> Result<(), StorageError> {
    let mut val = [0u8; DATA_LEN];
    val[..8].copy_from_slice(&info.balance.to_le_bytes());
    val[8..16].copy_from_slice(&info.nonce.to_le_bytes());
    slice.write(account_key(address), val)
}

/// Stores a contract image: header record plus `ceil(len/32)` data blocks.
pub fn store_contract_code(
    slice: &Slice,
    address: &Address,
    code: &[u8],
) -> Result<(), StorageError> {
    let mut header = [0u8; DATA_LEN];
    header[0] = 1;
    header[8..16].copy_from_slice(&(code.len() as u64).to_le_bytes());
    slice.write(code_header_key(address), header)?;

    for (i, chunk) in code.chunks(DATA_LEN).enumerate() {
        let mut val = [0u8; DATA_LEN];
        val[..chunk.len()].copy_from_slice(chunk);
        slice.write(code_block_key(address, i as u64), val)?;
    }
    Ok(())
}

/// Length of the code stored at `address`, or `None` when no code exists.
pub fn contract_code_len(slice: &Slice, address: &Address) -> Option<u64> {
    let header = slice.read(&code_header_key(address));
    if header[0] != 1 {
        return None;
    }
    Some(u64::from_le_bytes(header[8..16].try_into().unwrap()))
}

/// Reads back a stored contract image.
pub fn load_contract_code(slice: &Slice, address: &Address) -> Option<Vec<u8>> {
    let len = contract_code_len(slice, address)? as usize;
    let blocks = len.div_ceil(DATA_LEN);
    let mut out = Vec::with_capacity(blocks * DATA_LEN);
    for i in 0..blocks {
        out.extend_from_slice(&slice.read(&code_block_key(address, i as u64)));
    }
    out.truncate(len);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        let mut a = Address::zero();
        a.0[0] = n;
        a
    }

    #[test]
    fn missing_account_is_zero() {
        let slice = Slice::empty();
        assert_eq!(get_account_info(&slice, &addr(1)), AccountInfo::default());
    }

    #[test]
    fn account_roundtrip() {
        let slice = Slice::empty();
        let info = AccountInfo {
            balance: 12_345_678,
            nonce: 42,
        };
        set_account_info(&slice, &addr(1), info).unwrap();
        assert_eq!(get_account_info(&slice, &addr(1)), info);
        // Other addresses are untouched
        assert_eq!(get_account_info(&slice, &addr(2)), AccountInfo::default());
    }

    #[test]
    fn code_roundtrip_all_lengths_around_block_boundary() {
        let slice = Slice::empty();
        for len in [0usize, 1, 31, 32, 33, 64, 100, 4096] {
            let address = addr(len as u8);
            let code: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            store_contract_code(&slice, &address, &code).unwrap();
            assert_eq!(contract_code_len(&slice, &address), Some(len as u64));
            assert_eq!(load_contract_code(&slice, &address).unwrap(), code);
        }
    }

    #[test]
    fn absent_code_reads_as_none() {
        let slice = Slice::empty();
        assert_eq!(load_contract_code(&slice, &addr(9)), None);
    }

    #[test]
    fn code_and_account_keys_do_not_collide() {
        let slice = Slice::empty();
        let address = addr(1);
        set_account_info(
            &slice,
            &address,
            AccountInfo {
                balance: 5,
                nonce: 6,
            },
        )
        .unwrap();
        store_contract_code(&slice, &address, &[0xAB; 40]).unwrap();
        let info = get_account_info(&slice, &address);
        assert_eq!(info.balance, 5);
        assert_eq!(load_contract_code(&slice, &address).unwrap(), vec![0xAB; 40]);
    }

    #[test]
    fn storage_slot_keys_separate_contracts() {
        let slot = [3u8; 32];
        assert_ne!(
            storage_slot_key(&addr(1), &slot),
            storage_slot_key(&addr(2), &slot)
        );
    }
}
