// db/chatdb.rs
use async_trait::async_trait;
use uuid::Uuid;

use super::{db::DBClient, StoreError};
use crate::models::{
    chatmodels::*,
    jobmodel::PartyRole,
};

#[async_trait]
pub trait ChatExt {
    async fn create_or_get_conversation(
        &self,
        job_id: Uuid,
        client_id: Uuid,
        worker_id: Uuid,
    ) -> Result<Conversation, StoreError>;

    async fn get_conversation_by_id(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError>;

    async fn get_conversation_by_job(
        &self,
        job_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError>;

    async fn get_account_conversations(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<Conversation>, StoreError>;

    /// Assigns the next sequence number under the conversation's lock.
    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    async fn get_messages(
        &self,
        conversation_id: Uuid,
        after_sequence: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;

    async fn mark_read(
        &self,
        conversation_id: Uuid,
        account_id: Uuid,
        upto_sequence: i64,
    ) -> Result<Conversation, StoreError>;

    async fn toggle_archive(
        &self,
        conversation_id: Uuid,
        account_id: Uuid,
    ) -> Result<Conversation, StoreError>;
}

#[async_trait]
impl ChatExt for DBClient {
    async fn create_or_get_conversation(
        &self,
        job_id: Uuid,
        client_id: Uuid,
        worker_id: Uuid,
    ) -> Result<Conversation, StoreError> {
        let fresh = Conversation::new(job_id, client_id, worker_id);

        sqlx::query(
            r#"
            INSERT INTO conversations (id, job_id, client_id, worker_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id) DO NOTHING
            "#
        )
        .bind(fresh.id)
        .bind(job_id)
        .bind(client_id)
        .bind(worker_id)
        .bind(fresh.created_at)
        .execute(&self.pool)
        .await?;

        self.get_conversation_by_job(job_id)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn get_conversation_by_id(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE id = $1"
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(conversation)
    }

    async fn get_conversation_by_job(
        &self,
        job_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE job_id = $1"
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(conversation)
    }

    async fn get_account_conversations(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<Conversation>, StoreError> {
        let conversations = sqlx::query_as::<_, Conversation>(
            r#"
            SELECT * FROM conversations
            WHERE client_id = $1 OR worker_id = $1
            ORDER BY last_message_at DESC NULLS LAST, created_at DESC
            "#
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(conversations)
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let mut tx = self.pool.begin().await?;

        // The row lock taken by this UPDATE serializes concurrent appenders.
        let sequence = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE conversations
            SET last_sequence = last_sequence + 1,
                last_message = $2,
                last_message_at = NOW(),
                client_unread = client_unread + CASE WHEN $3::uuid IS DISTINCT FROM client_id THEN 1 ELSE 0 END,
                worker_unread = worker_unread + CASE WHEN $3::uuid IS DISTINCT FROM worker_id THEN 1 ELSE 0 END
            WHERE id = $1
            RETURNING last_sequence
            "#
        )
        .bind(message.conversation_id)
        .bind(&message.body)
        .bind(message.sender_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;

        let stored = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (id, conversation_id, sequence, sender_id, sender_name, message_type, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#
        )
        .bind(Uuid::new_v4())
        .bind(message.conversation_id)
        .bind(sequence)
        .bind(message.sender_id)
        .bind(&message.sender_name)
        .bind(message.message_type)
        .bind(&message.body)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn get_messages(
        &self,
        conversation_id: Uuid,
        after_sequence: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let messages = sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = $1 AND sequence > $2
            ORDER BY sequence ASC
            LIMIT $3
            "#
        )
        .bind(conversation_id)
        .bind(after_sequence)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    async fn mark_read(
        &self,
        conversation_id: Uuid,
        account_id: Uuid,
        upto_sequence: i64,
    ) -> Result<Conversation, StoreError> {
        let mut tx = self.pool.begin().await?;

        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE id = $1 FOR UPDATE"
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;

        let role = conversation.role_of(account_id).ok_or(StoreError::NotFound)?;
        let last_read = conversation
            .last_read_for(role)
            .max(upto_sequence.min(conversation.last_sequence));

        sqlx::query(
            r#"
            UPDATE messages
            SET read_at = NOW()
            WHERE conversation_id = $1
              AND sequence <= $2
              AND sender_id IS DISTINCT FROM $3
              AND read_at IS NULL
            "#
        )
        .bind(conversation_id)
        .bind(last_read)
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        let unread = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE conversation_id = $1
              AND sequence > $2
              AND sender_id IS DISTINCT FROM $3
            "#
        )
        .bind(conversation_id)
        .bind(last_read)
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;

        let update = match role {
            PartyRole::Client => {
                "UPDATE conversations SET client_last_read = $2, client_unread = $3 WHERE id = $1 RETURNING *"
            }
            PartyRole::Worker => {
                "UPDATE conversations SET worker_last_read = $2, worker_unread = $3 WHERE id = $1 RETURNING *"
            }
        };

        let updated = sqlx::query_as::<_, Conversation>(update)
            .bind(conversation_id)
            .bind(last_read)
            .bind(unread)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn toggle_archive(
        &self,
        conversation_id: Uuid,
        account_id: Uuid,
    ) -> Result<Conversation, StoreError> {
        let conversation = self
            .get_conversation_by_id(conversation_id)
            .await?
            .ok_or(StoreError::NotFound)?;

        let update = match conversation.role_of(account_id).ok_or(StoreError::NotFound)? {
            PartyRole::Client => {
                "UPDATE conversations SET client_archived = NOT client_archived WHERE id = $1 RETURNING *"
            }
            PartyRole::Worker => {
                "UPDATE conversations SET worker_archived = NOT worker_archived WHERE id = $1 RETURNING *"
            }
        };

        let updated = sqlx::query_as::<_, Conversation>(update)
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(updated)
    }
}
