//! `mint_and_bridge` instruction for the Solana bridge program

use super::events::discriminator;

use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_program;

pub const CONFIG_SEED: &[u8] = b"config";
pub const FOREIGN_TOKEN_SEED: &[u8] = b"foreign_token";

/// Bridge configuration PDA, which is also the mint authority
pub fn config_pda(program_id: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[CONFIG_SEED], program_id).0
}

/// Registration PDA for a foreign (EVM) token
pub fn foreign_token_pda(program_id: &Pubkey, foreign_address: &[u8; 32]) -> Pubkey {
    Pubkey::find_program_address(&[FOREIGN_TOKEN_SEED, foreign_address], program_id).0
}

/// Accounts and arguments of one mint
#[derive(Debug, Clone)]
pub struct MintAndBridge {
    pub program_id: Pubkey,
    pub relayer: Pubkey,
    pub receiver: Pubkey,
    pub token_mint: Pubkey,
    pub foreign_address: [u8; 32],
    pub amount: u64,
}

impl MintAndBridge {
    pub fn data(&self) -> Vec<u8> {
        let mut data = discriminator("global", "mint_and_bridge").to_vec();
        data.extend_from_slice(&self.foreign_address);
        data.extend_from_slice(&self.amount.to_le_bytes());
        data
    }

    pub fn instruction(&self) -> Instruction {
        let receiver_ata = spl_associated_token_account::get_associated_token_address(
            &self.receiver,
            &self.token_mint,
        );

        Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(self.relayer, true),
                AccountMeta::new_readonly(config_pda(&self.program_id), false),
                AccountMeta::new_readonly(
                    foreign_token_pda(&self.program_id, &self.foreign_address),
                    false,
                ),
                AccountMeta::new(self.token_mint, false),
                AccountMeta::new_readonly(self.receiver, false),
                AccountMeta::new(receiver_ata, false),
                AccountMeta::new_readonly(spl_token::id(), false),
                AccountMeta::new_readonly(spl_associated_token_account::id(), false),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data: self.data(),
        }
    }
}
