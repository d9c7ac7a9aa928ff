//! IMAP/SMTP implementation of [`MailProvider`]
//!
//! Each message is exposed as a single-message thread whose id encodes
//! mailbox, UIDVALIDITY and UID. System labels map onto flags (`UNREAD`,
//! `STARRED`, `IMPORTANT`) or special-use mailboxes (`TRASH`, `SPAM`,
//! `ARCHIVE`); user labels are mailboxes. Every call opens its own session
//! and logs out when done.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use utf7_imap::{decode_utf7_imap, encode_utf7_imap};

use crate::config::{ImapTimeouts, MailboxConfig};
use crate::errors::{AppError, AppResult};
use crate::imap::{self, FetchedMessage, ImapSession};
use crate::mime::{self, BODY_MAX_CHARS, ParsedMessage};
use crate::smtp::{self, Composition};
use crate::thread_id::{PageToken, ThreadId};
use crate::upstream::{
    Draft, DraftInput, DraftPage, EmailAlias, LABEL_ARCHIVE, LABEL_DRAFT, LABEL_IMPORTANT,
    LABEL_INBOX, LABEL_SENT, LABEL_SPAM, LABEL_STARRED, LABEL_TRASH, LABEL_UNREAD, Label,
    LabelKind, ListThreadsRequest, MailMessage, MailProvider, OutgoingEmail, ThreadDetail,
    ThreadPage, ThreadSummary, folder_label,
};

const SYSTEM_LABELS: [(&str, &str); 9] = [
    (LABEL_INBOX, "Inbox"),
    (LABEL_SENT, "Sent"),
    (LABEL_DRAFT, "Drafts"),
    (LABEL_TRASH, "Trash"),
    (LABEL_SPAM, "Spam"),
    (LABEL_ARCHIVE, "Archive"),
    (LABEL_UNREAD, "Unread"),
    (LABEL_STARRED, "Starred"),
    (LABEL_IMPORTANT, "Important"),
];

const IMPORTANT_KEYWORD: &str = "$Important";

fn is_system_label(id: &str) -> bool {
    SYSTEM_LABELS.iter().any(|(l, _)| *l == id)
}

/// Where a label change moves the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination {
    Inbox,
    Archive,
    Trash,
    Spam,
}

/// Label changes translated to IMAP operations
#[derive(Debug, Default, PartialEq, Eq)]
struct LabelPlan {
    add_flags: Vec<&'static str>,
    remove_flags: Vec<&'static str>,
    copy_to: Vec<String>,
    remove_from: Vec<String>,
    destination: Option<Destination>,
}

impl LabelPlan {
    fn build(add: &[String], remove: &[String]) -> AppResult<Self> {
        let mut plan = Self::default();
        for label in add {
            match label.as_str() {
                LABEL_UNREAD => plan.remove_flags.push("\\Seen"),
                LABEL_STARRED => plan.add_flags.push("\\Flagged"),
                LABEL_IMPORTANT => plan.add_flags.push(IMPORTANT_KEYWORD),
                LABEL_TRASH => plan.destination = Some(Destination::Trash),
                LABEL_SPAM => plan.destination = Some(Destination::Spam),
                LABEL_INBOX => plan.destination = Some(Destination::Inbox),
                LABEL_ARCHIVE => plan.destination = Some(Destination::Archive),
                LABEL_SENT | LABEL_DRAFT => {
                    return Err(AppError::invalid(format!("label {label} cannot be added")));
                }
                user => plan.copy_to.push(user.to_owned()),
            }
        }
        for label in remove {
            match label.as_str() {
                LABEL_UNREAD => plan.add_flags.push("\\Seen"),
                LABEL_STARRED => plan.remove_flags.push("\\Flagged"),
                LABEL_IMPORTANT => plan.remove_flags.push(IMPORTANT_KEYWORD),
                LABEL_INBOX => {
                    plan.destination.get_or_insert(Destination::Archive);
                }
                LABEL_TRASH | LABEL_SPAM => {
                    plan.destination.get_or_insert(Destination::Inbox);
                }
                LABEL_ARCHIVE => {}
                LABEL_SENT | LABEL_DRAFT => {
                    return Err(AppError::invalid(format!("label {label} cannot be removed")));
                }
                user => plan.remove_from.push(user.to_owned()),
            }
        }
        Ok(plan)
    }
}

/// Provider backed by one IMAP account and its SMTP submission server
pub struct ImapProvider {
    account: MailboxConfig,
    timeouts: ImapTimeouts,
    provider_id: String,
}

impl ImapProvider {
    pub fn new(account: MailboxConfig, timeouts: ImapTimeouts) -> Self {
        let provider_id = format!("imap:{}@{}", account.user, account.imap_host);
        Self {
            account,
            timeouts,
            provider_id,
        }
    }

    fn mailbox_for_label(&self, label: &str) -> String {
        let folders = &self.account.folders;
        match label {
            LABEL_INBOX => "INBOX".to_owned(),
            LABEL_SENT => folders.sent.clone(),
            LABEL_DRAFT => folders.drafts.clone(),
            LABEL_TRASH => folders.trash.clone(),
            LABEL_SPAM => folders.spam.clone(),
            LABEL_ARCHIVE => folders.archive.clone(),
            other => other.to_owned(),
        }
    }

    fn label_for_mailbox(&self, mailbox: &str) -> String {
        let folders = &self.account.folders;
        if mailbox.eq_ignore_ascii_case("INBOX") {
            LABEL_INBOX.to_owned()
        } else if mailbox == folders.sent {
            LABEL_SENT.to_owned()
        } else if mailbox == folders.drafts {
            LABEL_DRAFT.to_owned()
        } else if mailbox == folders.trash {
            LABEL_TRASH.to_owned()
        } else if mailbox == folders.spam {
            LABEL_SPAM.to_owned()
        } else if mailbox == folders.archive {
            LABEL_ARCHIVE.to_owned()
        } else {
            mailbox.to_owned()
        }
    }

    fn destination_mailbox(&self, destination: Destination) -> String {
        match destination {
            Destination::Inbox => "INBOX".to_owned(),
            Destination::Archive => self.account.folders.archive.clone(),
            Destination::Trash => self.account.folders.trash.clone(),
            Destination::Spam => self.account.folders.spam.clone(),
        }
    }

    fn is_special_mailbox(&self, mailbox: &str) -> bool {
        self.label_for_mailbox(mailbox) != mailbox
    }

    async fn open(&self) -> AppResult<ImapSession> {
        imap::connect_authenticated(&self.timeouts, &self.account).await
    }

    async fn close<T>(&self, session: ImapSession, result: AppResult<T>) -> AppResult<T> {
        imap::logout(&self.timeouts, session).await;
        result
    }

    /// Select the id's mailbox; a changed UIDVALIDITY means the message is gone
    async fn select_for(
        &self,
        session: &mut ImapSession,
        id: &ThreadId,
        writable: bool,
    ) -> AppResult<()> {
        let current = if writable {
            imap::select_mailbox_readwrite(&self.timeouts, session, &id.mailbox).await?
        } else {
            imap::select_mailbox_readonly(&self.timeouts, session, &id.mailbox).await?
        };
        if current != id.uidvalidity {
            return Err(AppError::NotFound(format!(
                "message {} no longer exists (mailbox snapshot changed)",
                id.encode()
            )));
        }
        Ok(())
    }

    async fn list_in(
        &self,
        session: &mut ImapSession,
        request: &ListThreadsRequest,
    ) -> AppResult<ThreadPage> {
        let mailbox = self.mailbox_for_label(&folder_label(&request.folder));
        let uidvalidity = imap::select_mailbox_readonly(&self.timeouts, session, &mailbox).await?;

        let token = request
            .page_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(PageToken::parse)
            .transpose()?;
        if let Some(t) = token
            && t.uidvalidity != uidvalidity
        {
            return Err(AppError::Conflict(
                "mailbox snapshot changed; restart listing".to_owned(),
            ));
        }
        let below_uid = token.map(|t| t.below_uid);
        if below_uid.is_some_and(|uid| uid <= 1) {
            return Ok(ThreadPage::default());
        }

        let query = build_search_query(request.query.as_deref(), &request.label_ids, below_uid)?;
        let uids = imap::uid_search(&self.timeouts, session, &query).await?;
        let limit = request.max_results.max(1);
        let page: Vec<u32> = uids.iter().take(limit).copied().collect();
        let next_page_token = if uids.len() > limit {
            page.last().map(|uid| {
                PageToken {
                    uidvalidity,
                    below_uid: *uid,
                }
                .encode()
            })
        } else {
            None
        };

        Ok(ThreadPage {
            threads: page
                .into_iter()
                .map(|uid| ThreadSummary {
                    id: ThreadId {
                        mailbox: mailbox.clone(),
                        uidvalidity,
                        uid,
                    }
                    .encode(),
                })
                .collect(),
            next_page_token,
        })
    }

    async fn fetch_parsed(
        &self,
        session: &mut ImapSession,
        id: &ThreadId,
    ) -> AppResult<(ParsedMessage, FetchedMessage)> {
        self.select_for(session, id, false).await?;
        let fetched = imap::fetch_message(&self.timeouts, session, id.uid).await?;
        Ok((mime::parse_message(&fetched.raw, BODY_MAX_CHARS)?, fetched))
    }

    fn to_message(
        &self,
        id: &ThreadId,
        parsed: ParsedMessage,
        fetched: &FetchedMessage,
    ) -> MailMessage {
        let encoded = id.encode();
        let (label_ids, unread) =
            labels_from_flags(&self.label_for_mailbox(&id.mailbox), &fetched.flags);
        MailMessage {
            id: encoded.clone(),
            thread_id: encoded,
            message_id: parsed.message_id,
            subject: parsed.subject,
            sender: parsed.sender,
            to: parsed.to,
            cc: parsed.cc,
            received_on: received_on(parsed.date, fetched.internal_date),
            label_ids,
            unread,
            body_text: parsed.body_text,
            body_html: parsed.body_html_sanitized,
            attachments: parsed.attachments,
        }
    }

    async fn apply_plan(
        &self,
        session: &mut ImapSession,
        mailbox: &str,
        uidvalidity: u32,
        uids: &[u32],
        plan: &LabelPlan,
    ) -> AppResult<()> {
        let current = imap::select_mailbox_readwrite(&self.timeouts, session, mailbox).await?;
        if current != uidvalidity {
            return Err(AppError::Conflict(format!(
                "mailbox '{mailbox}' snapshot changed; refresh threads"
            )));
        }

        if !plan.add_flags.is_empty() {
            let query = format!("+FLAGS.SILENT ({})", plan.add_flags.join(" "));
            imap::uid_store(&self.timeouts, session, uids, &query).await?;
        }
        if !plan.remove_flags.is_empty() {
            let query = format!("-FLAGS.SILENT ({})", plan.remove_flags.join(" "));
            imap::uid_store(&self.timeouts, session, uids, &query).await?;
        }
        for label in plan.copy_to.iter().filter(|l| l.as_str() != mailbox) {
            imap::uid_copy(&self.timeouts, session, uids, label).await?;
        }

        let mut destination = plan.destination;
        if plan.remove_from.iter().any(|l| l == mailbox) {
            destination.get_or_insert(Destination::Archive);
        }
        let other_labels: Vec<&String> =
            plan.remove_from.iter().filter(|l| l.as_str() != mailbox).collect();
        let mut message_ids = Vec::new();
        if !other_labels.is_empty() {
            for uid in uids {
                let fetched = imap::fetch_message(&self.timeouts, session, *uid).await?;
                if let Some(mid) = mime::parse_message(&fetched.raw, 0)?.message_id {
                    message_ids.push(mid);
                }
            }
        }

        if let Some(dest) = destination {
            let target = self.destination_mailbox(dest);
            if target != mailbox {
                imap::uid_move(&self.timeouts, session, uids, &target).await?;
            }
        }

        for label in other_labels {
            imap::select_mailbox_readwrite(&self.timeouts, session, label).await?;
            let mut copies = Vec::new();
            for mid in &message_ids {
                let query = format!("HEADER Message-ID \"{}\"", escape_imap_quoted(mid)?);
                copies.extend(imap::uid_search(&self.timeouts, session, &query).await?);
            }
            imap::uid_store(&self.timeouts, session, &copies, "+FLAGS.SILENT (\\Deleted)").await?;
            imap::uid_expunge(&self.timeouts, session, &copies).await?;
        }
        Ok(())
    }

    async fn list_labels_in(&self, session: &mut ImapSession) -> AppResult<Vec<Label>> {
        let mut labels: Vec<Label> = SYSTEM_LABELS
            .iter()
            .map(|(id, name)| Label {
                id: (*id).to_owned(),
                name: (*name).to_owned(),
                kind: LabelKind::System,
            })
            .collect();
        for item in imap::list_all_mailboxes(&self.timeouts, session).await? {
            let raw = item.name();
            if self.is_special_mailbox(raw) {
                continue;
            }
            labels.push(Label {
                id: raw.to_owned(),
                name: decode_utf7_imap(raw.to_owned()),
                kind: LabelKind::User,
            });
        }
        Ok(labels)
    }

    async fn get_draft_in(&self, session: &mut ImapSession, draft_id: &str) -> AppResult<Draft> {
        let id = ThreadId::parse(draft_id)?;
        let (parsed, fetched) = self.fetch_parsed(session, &id).await?;
        Ok(Draft {
            id: id.encode(),
            to: parsed.to.iter().map(|s| s.display()).collect(),
            subject: parsed.subject,
            body: parsed.body_text,
            updated_on: received_on(parsed.date, fetched.internal_date),
        })
    }

    async fn delete_draft_in(&self, session: &mut ImapSession, draft_id: &str) -> AppResult<()> {
        let id = ThreadId::parse(draft_id)?;
        self.select_for(session, &id, true).await?;
        imap::fetch_flags(&self.timeouts, session, id.uid).await?;
        imap::uid_store(&self.timeouts, session, &[id.uid], "+FLAGS.SILENT (\\Deleted)").await?;
        imap::uid_expunge(&self.timeouts, session, &[id.uid]).await
    }

    async fn append_sent(&self, raw: &[u8]) -> AppResult<()> {
        let mut session = self.open().await?;
        let result = imap::append(
            &self.timeouts,
            &mut session,
            &self.account.folders.sent,
            Some("(\\Seen)"),
            raw,
        )
        .await;
        self.close(session, result).await
    }
}

#[async_trait]
impl MailProvider for ImapProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn list_threads(&self, request: &ListThreadsRequest) -> AppResult<ThreadPage> {
        let mut session = self.open().await?;
        let result = self.list_in(&mut session, request).await;
        self.close(session, result).await
    }

    async fn get_thread(&self, thread_id: &str) -> AppResult<ThreadDetail> {
        let id = ThreadId::parse(thread_id)?;
        let mut session = self.open().await?;
        let result = self.fetch_parsed(&mut session, &id).await;
        let (parsed, fetched) = self.close(session, result).await?;
        Ok(ThreadDetail {
            id: id.encode(),
            messages: vec![self.to_message(&id, parsed, &fetched)],
        })
    }

    async fn modify_labels(
        &self,
        thread_ids: &[String],
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> AppResult<()> {
        if thread_ids.is_empty() {
            return Ok(());
        }
        let plan = LabelPlan::build(add_label_ids, remove_label_ids)?;
        let mut groups: BTreeMap<(String, u32), Vec<u32>> = BTreeMap::new();
        for raw in thread_ids {
            let id = ThreadId::parse(raw)?;
            groups
                .entry((id.mailbox, id.uidvalidity))
                .or_default()
                .push(id.uid);
        }

        let mut session = self.open().await?;
        let mut result = Ok(());
        for ((mailbox, uidvalidity), uids) in &groups {
            result = self
                .apply_plan(&mut session, mailbox, *uidvalidity, uids, &plan)
                .await;
            if result.is_err() {
                break;
            }
        }
        self.close(session, result).await
    }

    async fn list_labels(&self) -> AppResult<Vec<Label>> {
        let mut session = self.open().await?;
        let result = self.list_labels_in(&mut session).await;
        self.close(session, result).await
    }

    async fn get_label(&self, label_id: &str) -> AppResult<Label> {
        if let Some((id, name)) = SYSTEM_LABELS.iter().find(|(id, _)| *id == label_id) {
            return Ok(Label {
                id: (*id).to_owned(),
                name: (*name).to_owned(),
                kind: LabelKind::System,
            });
        }
        self.list_labels()
            .await?
            .into_iter()
            .find(|l| l.id == label_id)
            .ok_or_else(|| AppError::NotFound(format!("label '{label_id}' not found")))
    }

    async fn create_label(&self, name: &str) -> AppResult<Label> {
        validate_label_name(name)?;
        let encoded = encode_utf7_imap(name.trim().to_owned());
        if is_system_label(&encoded) || self.is_special_mailbox(&encoded) {
            return Err(AppError::Conflict(format!("label '{name}' is reserved")));
        }
        let mut session = self.open().await?;
        let result = imap::create_mailbox(&self.timeouts, &mut session, &encoded).await;
        self.close(session, result).await?;
        Ok(Label {
            id: encoded,
            name: name.trim().to_owned(),
            kind: LabelKind::User,
        })
    }

    async fn update_label(&self, label_id: &str, name: &str) -> AppResult<Label> {
        if is_system_label(label_id) {
            return Err(AppError::invalid("system labels cannot be renamed"));
        }
        validate_label_name(name)?;
        let encoded = encode_utf7_imap(name.trim().to_owned());
        let mut session = self.open().await?;
        let result = imap::rename_mailbox(&self.timeouts, &mut session, label_id, &encoded).await;
        self.close(session, result).await?;
        Ok(Label {
            id: encoded,
            name: name.trim().to_owned(),
            kind: LabelKind::User,
        })
    }

    async fn delete_label(&self, label_id: &str) -> AppResult<()> {
        if is_system_label(label_id) || self.is_special_mailbox(label_id) {
            return Err(AppError::invalid("system labels cannot be deleted"));
        }
        let mut session = self.open().await?;
        let result = imap::delete_mailbox(&self.timeouts, &mut session, label_id).await;
        self.close(session, result).await
    }

    async fn create_draft(&self, draft: &DraftInput) -> AppResult<Draft> {
        let composed = smtp::compose(
            &self.account,
            &Composition {
                to: &draft.to,
                cc: &draft.cc,
                bcc: &draft.bcc,
                subject: &draft.subject,
                body_text: &draft.body,
                in_reply_to: draft.in_reply_to.as_deref(),
                keep_bcc: true,
                ..Composition::default()
            },
        )?;
        let raw = composed.message.formatted();
        let drafts = self.account.folders.drafts.clone();
        let search = format!(
            "HEADER Message-ID \"{}\"",
            escape_imap_quoted(&composed.message_id)?
        );

        let mut session = self.open().await?;
        let result: AppResult<ThreadId> = async {
            if let Some(old) = draft.draft_id.as_deref() {
                match self.delete_draft_in(&mut session, old).await {
                    Ok(()) | Err(AppError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            imap::append(
                &self.timeouts,
                &mut session,
                &drafts,
                Some("(\\Draft \\Seen)"),
                &raw,
            )
            .await?;
            let uidvalidity =
                imap::select_mailbox_readonly(&self.timeouts, &mut session, &drafts).await?;
            let uid = imap::uid_search(&self.timeouts, &mut session, &search)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| AppError::Internal("appended draft not found".to_owned()))?;
            Ok(ThreadId {
                mailbox: drafts.clone(),
                uidvalidity,
                uid,
            })
        }
        .await;
        let id = self.close(session, result).await?;

        Ok(Draft {
            id: id.encode(),
            to: draft.to.clone(),
            subject: draft.subject.clone(),
            body: Some(draft.body.clone()),
            updated_on: mime::format_timestamp(&Utc::now()),
        })
    }

    async fn get_draft(&self, draft_id: &str) -> AppResult<Draft> {
        let mut session = self.open().await?;
        let result = self.get_draft_in(&mut session, draft_id).await;
        self.close(session, result).await
    }

    async fn list_drafts(
        &self,
        page_token: Option<&str>,
        max_results: usize,
    ) -> AppResult<DraftPage> {
        let request = ListThreadsRequest {
            folder: "drafts".to_owned(),
            max_results,
            page_token: page_token.map(str::to_owned),
            ..ListThreadsRequest::default()
        };
        let mut session = self.open().await?;
        let result: AppResult<DraftPage> = async {
            let page = self.list_in(&mut session, &request).await?;
            let mut drafts = Vec::with_capacity(page.threads.len());
            for summary in &page.threads {
                drafts.push(self.get_draft_in(&mut session, &summary.id).await?);
            }
            Ok(DraftPage {
                drafts,
                next_page_token: page.next_page_token,
            })
        }
        .await;
        self.close(session, result).await
    }

    async fn delete_draft(&self, draft_id: &str) -> AppResult<()> {
        let mut session = self.open().await?;
        let result = self.delete_draft_in(&mut session, draft_id).await;
        self.close(session, result).await
    }

    async fn send_draft(&self, draft_id: &str) -> AppResult<()> {
        let id = ThreadId::parse(draft_id)?;
        let mut session = self.open().await?;
        let fetched = self.fetch_parsed(&mut session, &id).await;
        let (parsed, _) = match fetched {
            Ok(v) => v,
            Err(e) => return self.close(session, Err(e)).await,
        };

        let to: Vec<String> = parsed.to.iter().map(|s| s.display()).collect();
        let cc: Vec<String> = parsed.cc.iter().map(|s| s.display()).collect();
        let bcc: Vec<String> = parsed.bcc.iter().map(|s| s.display()).collect();
        let composed = smtp::compose(
            &self.account,
            &Composition {
                to: &to,
                cc: &cc,
                bcc: &bcc,
                subject: &parsed.subject,
                body_text: parsed.body_text.as_deref().unwrap_or_default(),
                in_reply_to: parsed.in_reply_to.as_deref(),
                ..Composition::default()
            },
        );
        let composed = match composed {
            Ok(c) => c,
            Err(e) => return self.close(session, Err(e)).await,
        };
        let raw = composed.message.formatted();
        if let Err(e) = smtp::send(&self.account, composed.message).await {
            return self.close(session, Err(e)).await;
        }

        let result: AppResult<()> = async {
            imap::append(
                &self.timeouts,
                &mut session,
                &self.account.folders.sent,
                Some("(\\Seen)"),
                &raw,
            )
            .await?;
            self.delete_draft_in(&mut session, draft_id).await
        }
        .await;
        self.close(session, result).await
    }

    async fn send_email(&self, email: &OutgoingEmail) -> AppResult<()> {
        let composed = smtp::compose(
            &self.account,
            &Composition {
                from: email.from_alias.as_deref(),
                to: &email.to,
                cc: &email.cc,
                bcc: &email.bcc,
                subject: &email.subject,
                body_text: &email.body_text,
                body_html: email.body_html.as_deref(),
                in_reply_to: email.in_reply_to.as_deref(),
                keep_bcc: false,
            },
        )?;
        let raw = composed.message.formatted();
        smtp::send(&self.account, composed.message).await?;
        if let Err(e) = self.append_sent(&raw).await {
            tracing::warn!(error = %e, "sent message could not be stored in sent mailbox");
        }
        Ok(())
    }

    async fn aliases(&self) -> AppResult<Vec<EmailAlias>> {
        let mut aliases = vec![EmailAlias {
            email: self.account.user.clone(),
            name: self.account.display_name.clone(),
            primary: true,
        }];
        aliases.extend(self.account.aliases.iter().map(|email| EmailAlias {
            email: email.clone(),
            name: self.account.display_name.clone(),
            primary: false,
        }));
        Ok(aliases)
    }
}

/// Message timestamp: the Date header, else the server's `INTERNALDATE`
///
/// Only a message with neither falls back to the current time.
fn received_on(header_date: Option<String>, internal_date: Option<DateTime<Utc>>) -> String {
    header_date
        .or_else(|| internal_date.map(|d| mime::format_timestamp(&d)))
        .unwrap_or_else(|| mime::format_timestamp(&Utc::now()))
}

/// Derive label ids and unread state from the mailbox label and IMAP flags
fn labels_from_flags(mailbox_label: &str, flags: &[String]) -> (Vec<String>, bool) {
    let has = |name: &str| flags.iter().any(|f| f.eq_ignore_ascii_case(name));
    let unread = !has("\\Seen");
    let mut labels = vec![mailbox_label.to_owned()];
    if unread {
        labels.push(LABEL_UNREAD.to_owned());
    }
    if has("\\Flagged") {
        labels.push(LABEL_STARRED.to_owned());
    }
    if has(IMPORTANT_KEYWORD) {
        labels.push(LABEL_IMPORTANT.to_owned());
    }
    if has("\\Draft") && mailbox_label != LABEL_DRAFT {
        labels.push(LABEL_DRAFT.to_owned());
    }
    (labels, unread)
}

/// Build IMAP SEARCH query from listing filters
///
/// Flag-backed label ids are OR-ed together; other label ids are mailboxes
/// and are selected rather than searched.
fn build_search_query(
    query: Option<&str>,
    label_ids: &[String],
    below_uid: Option<u32>,
) -> AppResult<String> {
    let mut parts = Vec::new();
    if let Some(uid) = below_uid {
        parts.push(format!("UID 1:{}", uid.saturating_sub(1).max(1)));
    }
    if let Some(q) = query.map(str::trim).filter(|q| !q.is_empty()) {
        parts.push(format!("TEXT \"{}\"", escape_imap_quoted(q)?));
    }

    let flag_keys: Vec<&str> = label_ids
        .iter()
        .filter_map(|l| match l.as_str() {
            LABEL_UNREAD => Some("UNSEEN"),
            LABEL_STARRED => Some("FLAGGED"),
            LABEL_IMPORTANT => Some("KEYWORD $Important"),
            _ => None,
        })
        .collect();
    if let Some(last) = flag_keys.last() {
        let chained = flag_keys[..flag_keys.len() - 1]
            .iter()
            .rev()
            .fold((*last).to_owned(), |acc, key| format!("OR {key} {acc}"));
        parts.push(chained);
    }

    if parts.is_empty() {
        Ok("ALL".to_owned())
    } else {
        Ok(parts.join(" "))
    }
}

/// Escape backslashes and quotes for IMAP quoted strings
fn escape_imap_quoted(input: &str) -> AppResult<String> {
    if input.chars().any(|c| c == '\r' || c == '\n' || c == '\0') {
        return Err(AppError::invalid("search text must not contain line breaks"));
    }
    Ok(input.replace('\\', "\\\\").replace('"', "\\\""))
}

fn validate_label_name(name: &str) -> AppResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().count() > 225 {
        return Err(AppError::invalid("label name must be 1..225 characters"));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(AppError::invalid("label name must not contain control characters"));
    }
    Ok(())
}
